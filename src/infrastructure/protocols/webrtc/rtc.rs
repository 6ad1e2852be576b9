/// Transport port implemented with webrtc-rs
///
/// Engine callbacks are forwarded as [`TransportEvent`]s; disposable
/// connections (created without an event sender) install no handlers.
use crate::domain::shared::{MediaKind, Result, SessionError};
use crate::domain::transport::{
    Certificate, ConnectionState, DataChannel, DataChannelOptions, IceCandidate, PeerConnection,
    PeerConnectionFactory, RawTrack, RawTrackRef, SdpType, SendParameters, SessionDescription,
    StreamMessage, Transceiver, TransceiverDirection, TransceiverInit, TransportEvent,
    TransportEventSender,
};
use async_trait::async_trait;
use rcgen::KeyPair;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::certificate::RTCCertificate;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

fn codec_type(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Audio => RTPCodecType::Audio,
        MediaKind::Video => RTPCodecType::Video,
    }
}

fn media_kind(codec: RTPCodecType) -> MediaKind {
    match codec {
        RTPCodecType::Audio => MediaKind::Audio,
        _ => MediaKind::Video,
    }
}

fn transceiver_direction(direction: TransceiverDirection) -> RTCRtpTransceiverDirection {
    match direction {
        TransceiverDirection::SendRecv => RTCRtpTransceiverDirection::Sendrecv,
        TransceiverDirection::SendOnly => RTCRtpTransceiverDirection::Sendonly,
        TransceiverDirection::RecvOnly => RTCRtpTransceiverDirection::Recvonly,
        TransceiverDirection::Inactive => RTCRtpTransceiverDirection::Inactive,
    }
}

fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    Ok(match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
    })
}

fn from_description(desc: RTCSessionDescription) -> SessionDescription {
    match desc.sdp_type {
        RTCSdpType::Answer => SessionDescription::answer(desc.sdp),
        _ => SessionDescription::offer(desc.sdp),
    }
}

/// Captured media fed by the application through `TrackLocalStaticSample`
pub struct WebRtcLocalTrack {
    inner: Arc<TrackLocalStaticSample>,
    kind: MediaKind,
    stopped: AtomicBool,
}

impl WebRtcLocalTrack {
    pub fn new(
        kind: MediaKind,
        mime_type: &str,
        id: impl Into<String>,
        stream_id: impl Into<String>,
    ) -> Self {
        let capability = RTCRtpCodecCapability {
            mime_type: mime_type.to_string(),
            ..Default::default()
        };
        Self {
            inner: Arc::new(TrackLocalStaticSample::new(
                capability,
                id.into(),
                stream_id.into(),
            )),
            kind,
            stopped: AtomicBool::new(false),
        }
    }

    /// Sample writer for the application's encoder
    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        self.inner.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for WebRtcLocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WebRtcLocalTrack({}, {})", self.inner.id(), self.kind)
    }
}

impl RawTrack for WebRtcLocalTrack {
    fn id(&self) -> String {
        self.inner.id().to_string()
    }
    fn kind(&self) -> MediaKind {
        self.kind
    }
    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn local_track(raw: &RawTrackRef) -> Result<Arc<dyn TrackLocal + Send + Sync>> {
    raw.as_any()
        .downcast_ref::<WebRtcLocalTrack>()
        .map(|t| t.inner.clone() as Arc<dyn TrackLocal + Send + Sync>)
        .ok_or_else(|| {
            SessionError::Engine(format!("track {} is not a webrtc local track", raw.id()))
        })
}

/// Media received from the remote peer
pub struct WebRtcRemoteTrack {
    inner: Arc<TrackRemote>,
    stopped: AtomicBool,
}

impl WebRtcRemoteTrack {
    pub fn new(inner: Arc<TrackRemote>) -> Self {
        Self {
            inner,
            stopped: AtomicBool::new(false),
        }
    }

    /// RTP reader for the application's decoder
    pub fn remote(&self) -> Arc<TrackRemote> {
        self.inner.clone()
    }
}

impl fmt::Debug for WebRtcRemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WebRtcRemoteTrack({})", self.inner.id())
    }
}

impl RawTrack for WebRtcRemoteTrack {
    fn id(&self) -> String {
        self.inner.id()
    }
    fn kind(&self) -> MediaKind {
        media_kind(self.inner.kind())
    }
    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct WebRtcTransceiver {
    inner: Arc<RTCRtpTransceiver>,
    /// webrtc-rs fixes send encodings at creation; the requested layers are kept here
    encodings: StdMutex<SendParameters>,
}

impl WebRtcTransceiver {
    fn new(inner: Arc<RTCRtpTransceiver>) -> Self {
        Self {
            inner,
            encodings: StdMutex::new(SendParameters::default()),
        }
    }
}

#[async_trait]
impl Transceiver for WebRtcTransceiver {
    fn mid(&self) -> Option<String> {
        self.inner.mid().map(|m| m.to_string())
    }

    fn has_sender(&self) -> bool {
        true
    }

    async fn set_direction(&self, direction: TransceiverDirection) -> Result<()> {
        self.inner
            .set_direction(transceiver_direction(direction))
            .await;
        Ok(())
    }

    async fn replace_track(&self, track: Option<RawTrackRef>) -> Result<()> {
        let local = track.as_ref().map(local_track).transpose()?;
        self.inner.sender().await.replace_track(local).await?;
        Ok(())
    }

    async fn get_parameters(&self) -> Result<SendParameters> {
        self.encodings
            .lock()
            .map(|p| p.clone())
            .map_err(|e| SessionError::Engine(e.to_string()))
    }

    async fn set_parameters(&self, parameters: SendParameters) -> Result<()> {
        debug!(
            "Send parameters for mid {:?}: {} layer(s)",
            self.mid(),
            parameters.encodings.len()
        );
        let mut current = self
            .encodings
            .lock()
            .map_err(|e| SessionError::Engine(e.to_string()))?;
        *current = parameters;
        Ok(())
    }
}

pub struct WebRtcDataChannel {
    inner: Arc<RTCDataChannel>,
}

impl WebRtcDataChannel {
    /// Forward the channel's callbacks as transport events
    fn bind(inner: Arc<RTCDataChannel>, events: &TransportEventSender) -> Arc<Self> {
        let label = inner.label().to_string();

        let (tx, l) = (events.clone(), label.clone());
        inner.on_open(Box::new(move || {
            let _ = tx.send(TransportEvent::DataChannelOpen { label: l });
            Box::pin(async {})
        }));

        let (tx, l) = (events.clone(), label.clone());
        inner.on_message(Box::new(move |msg: DataChannelMessage| {
            let message = if msg.is_string {
                StreamMessage::Text(String::from_utf8_lossy(&msg.data).into_owned())
            } else {
                StreamMessage::Binary(msg.data)
            };
            let _ = tx.send(TransportEvent::DataChannelMessage {
                label: l.clone(),
                message,
            });
            Box::pin(async {})
        }));

        let (tx, l) = (events.clone(), label.clone());
        inner.on_close(Box::new(move || {
            let _ = tx.send(TransportEvent::DataChannelClose { label: l.clone() });
            Box::pin(async {})
        }));

        let (tx, l) = (events.clone(), label);
        inner.on_error(Box::new(move |e| {
            let _ = tx.send(TransportEvent::DataChannelError {
                label: l.clone(),
                error: e.to_string(),
            });
            Box::pin(async {})
        }));

        Arc::new(Self { inner })
    }
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> String {
        self.inner.label().to_string()
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.inner.send_text(text).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await?;
        Ok(())
    }
}

pub struct WebRtcPeerConnection {
    inner: Arc<RTCPeerConnection>,
    events: Option<TransportEventSender>,
}

impl WebRtcPeerConnection {
    fn bind(inner: Arc<RTCPeerConnection>, events: Option<TransportEventSender>) -> Self {
        if let Some(events) = &events {
            let tx = events.clone();
            inner.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let channel: Arc<dyn DataChannel> = WebRtcDataChannel::bind(dc, &tx);
                let _ = tx.send(TransportEvent::RemoteDataChannel { channel });
                Box::pin(async {})
            }));

            let tx = events.clone();
            inner.on_track(Box::new(move |track, _receiver, transceiver| {
                let stream_id = Some(track.stream_id()).filter(|s| !s.is_empty());
                let _ = tx.send(TransportEvent::TrackAdded {
                    mid: transceiver.mid().map(|m| m.to_string()),
                    track: Arc::new(WebRtcRemoteTrack::new(track)),
                    transceiver: Some(Arc::new(WebRtcTransceiver::new(transceiver))),
                    stream_id,
                });
                Box::pin(async {})
            }));

            let tx = events.clone();
            inner.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let candidate = candidate.and_then(|c| c.to_json().ok()).map(|init| IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                });
                let _ = tx.send(TransportEvent::IceCandidate(candidate));
                Box::pin(async {})
            }));

            let tx = events.clone();
            inner.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                let _ = tx.send(TransportEvent::IceConnectionStateChanged(state.to_string()));
                Box::pin(async {})
            }));

            let tx = events.clone();
            inner.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let _ = tx.send(TransportEvent::ConnectionStateChanged(connection_state(state)));
                Box::pin(async {})
            }));
        }
        Self { inner, events }
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(from_description(self.inner.create_offer(None).await?))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(from_description(self.inner.create_answer(None).await?))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.inner.set_local_description(description(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.inner.set_remote_description(description(desc)?).await?;
        Ok(())
    }

    async fn add_transceiver_from_track(
        &self,
        track: RawTrackRef,
        init: TransceiverInit,
    ) -> Result<Arc<dyn Transceiver>> {
        let local = local_track(&track)?;
        let transceiver = self
            .inner
            .add_transceiver_from_track(
                local,
                Some(RTCRtpTransceiverInit {
                    direction: transceiver_direction(init.direction),
                    send_encodings: Vec::new(),
                }),
            )
            .await?;
        let transceiver = WebRtcTransceiver::new(transceiver);
        transceiver
            .set_parameters(SendParameters {
                encodings: init.send_encodings,
            })
            .await?;
        Ok(Arc::new(transceiver))
    }

    async fn add_transceiver_from_kind(
        &self,
        kind: MediaKind,
        init: TransceiverInit,
    ) -> Result<Arc<dyn Transceiver>> {
        let transceiver = self
            .inner
            .add_transceiver_from_kind(
                codec_type(kind),
                Some(RTCRtpTransceiverInit {
                    direction: transceiver_direction(init.direction),
                    send_encodings: Vec::new(),
                }),
            )
            .await?;
        Ok(Arc::new(WebRtcTransceiver::new(transceiver)))
    }

    async fn transceivers(&self) -> Vec<Arc<dyn Transceiver>> {
        self.inner
            .get_transceivers()
            .await
            .into_iter()
            .map(|t| Arc::new(WebRtcTransceiver::new(t)) as Arc<dyn Transceiver>)
            .collect()
    }

    async fn remove_track(&self, transceiver: &Arc<dyn Transceiver>) -> Result<()> {
        let Some(mid) = transceiver.mid() else {
            return Ok(());
        };
        for t in self.inner.get_transceivers().await {
            if t.mid().map(|m| m.to_string()).as_deref() == Some(mid.as_str()) {
                let sender = t.sender().await;
                self.inner.remove_track(&sender).await?;
                return Ok(());
            }
        }
        Err(SessionError::Engine(format!("no transceiver for mid {}", mid)))
    }

    async fn create_data_channel(
        &self,
        label: &str,
        options: DataChannelOptions,
    ) -> Result<Arc<dyn DataChannel>> {
        let init = RTCDataChannelInit {
            ordered: options.ordered,
            max_retransmits: options.max_retransmits,
            protocol: options.protocol,
            ..Default::default()
        };
        let channel = self.inner.create_data_channel(label, Some(init)).await?;
        let channel: Arc<dyn DataChannel> = match &self.events {
            Some(events) => WebRtcDataChannel::bind(channel, events),
            None => Arc::new(WebRtcDataChannel { inner: channel }),
        };
        Ok(channel)
    }

    fn connection_state(&self) -> ConnectionState {
        connection_state(self.inner.connection_state())
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await?;
        Ok(())
    }
}

/// Creates webrtc-rs peer connections sharing one API instance
pub struct WebRtcFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcFactory {
    pub fn new(ice_servers: Vec<String>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        info!("WebRTC engine ready with {} ICE server(s)", ice_servers.len());
        Ok(Self { api, ice_servers })
    }

    fn configuration(&self, certificates: Vec<RTCCertificate>) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            certificates,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcFactory {
    /// ECDSA P-256, the key type webrtc-rs picks for connections created
    /// without certificates
    async fn generate_certificate(&self) -> Result<Certificate> {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| SessionError::Engine(format!("key generation failed: {}", e)))?;
        let certificate = RTCCertificate::from_key_pair(key_pair)?;
        debug!("Generated connection certificate");
        Ok(Certificate(Arc::new(certificate)))
    }

    async fn create(
        &self,
        certificate: &Certificate,
        events: Option<TransportEventSender>,
    ) -> Result<Arc<dyn PeerConnection>> {
        let certificate = certificate
            .0
            .downcast_ref::<RTCCertificate>()
            .cloned()
            .ok_or_else(|| SessionError::Engine("foreign certificate".to_string()))?;
        let pc = self
            .api
            .new_peer_connection(self.configuration(vec![certificate]))
            .await?;
        Ok(Arc::new(WebRtcPeerConnection::bind(Arc::new(pc), events)))
    }
}
