//! Media transport engine port
//!
//! The session drives a WebRTC-style engine through these traits. The engine
//! reports asynchronous happenings (data channel open, remote tracks, state
//! changes) as [`TransportEvent`]s on the channel handed to
//! [`PeerConnectionFactory::create`].

use crate::domain::shared::{MediaKind, Result};
use crate::domain::track::Encoding;
use async_trait::async_trait;
use bytes::Bytes;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Peer connection state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Answer, sdp: sdp.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransceiverDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

/// Options for a new transceiver
#[derive(Debug, Clone)]
pub struct TransceiverInit {
    pub direction: TransceiverDirection,
    pub send_encodings: Vec<Encoding>,
    pub stream_id: Option<String>,
}

impl TransceiverInit {
    pub fn send_only(stream_id: Option<String>) -> Self {
        Self {
            direction: TransceiverDirection::SendOnly,
            send_encodings: Vec::new(),
            stream_id,
        }
    }

    pub fn recv_only() -> Self {
        Self {
            direction: TransceiverDirection::RecvOnly,
            send_encodings: Vec::new(),
            stream_id: None,
        }
    }
}

/// Sender parameters exposed by a transceiver
#[derive(Debug, Clone, Default)]
pub struct SendParameters {
    pub encodings: Vec<Encoding>,
}

#[derive(Debug, Clone, Default)]
pub struct DataChannelOptions {
    pub ordered: Option<bool>,
    pub max_retransmits: Option<u16>,
    pub protocol: Option<String>,
}

/// Payload received on a data channel
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Text(String),
    Binary(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// Raw media handle (captured or received track) owned by the application/engine
pub trait RawTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> String;
    fn kind(&self) -> MediaKind;
    /// Stop producing/consuming media. A stopped handle is never reused.
    fn stop(&self);
    fn as_any(&self) -> &dyn Any;
}

pub type RawTrackRef = Arc<dyn RawTrack>;

/// A group of raw tracks published together
#[derive(Debug, Clone)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<RawTrackRef>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<RawTrackRef>) -> Self {
        Self { id: id.into(), tracks }
    }
}

#[async_trait]
pub trait Transceiver: Send + Sync {
    /// Transport section id, fixed once a description has been applied
    fn mid(&self) -> Option<String>;
    fn has_sender(&self) -> bool;
    async fn set_direction(&self, direction: TransceiverDirection) -> Result<()>;
    async fn replace_track(&self, track: Option<RawTrackRef>) -> Result<()>;
    async fn get_parameters(&self) -> Result<SendParameters>;
    async fn set_parameters(&self, parameters: SendParameters) -> Result<()>;
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;
    async fn send_text(&self, text: String) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;
    async fn add_transceiver_from_track(
        &self,
        track: RawTrackRef,
        init: TransceiverInit,
    ) -> Result<Arc<dyn Transceiver>>;
    async fn add_transceiver_from_kind(
        &self,
        kind: MediaKind,
        init: TransceiverInit,
    ) -> Result<Arc<dyn Transceiver>>;
    async fn transceivers(&self) -> Vec<Arc<dyn Transceiver>>;
    /// Detach the sender of `transceiver` from this connection
    async fn remove_track(&self, transceiver: &Arc<dyn Transceiver>) -> Result<()>;
    async fn create_data_channel(
        &self,
        label: &str,
        options: DataChannelOptions,
    ) -> Result<Arc<dyn DataChannel>>;
    fn connection_state(&self) -> ConnectionState;
    async fn close(&self) -> Result<()>;
}

/// Asynchronous engine notifications
pub enum TransportEvent {
    /// A data channel (local or remote) finished opening
    DataChannelOpen { label: String },
    DataChannelMessage { label: String, message: StreamMessage },
    DataChannelClose { label: String },
    DataChannelError { label: String, error: String },
    /// The remote peer opened a data channel
    RemoteDataChannel { channel: Arc<dyn DataChannel> },
    /// A remote track arrived on the transport section `mid`
    TrackAdded {
        mid: Option<String>,
        track: RawTrackRef,
        transceiver: Option<Arc<dyn Transceiver>>,
        stream_id: Option<String>,
    },
    /// `None` marks the end of candidates
    IceCandidate(Option<IceCandidate>),
    IceConnectionStateChanged(String),
    ConnectionStateChanged(ConnectionState),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::DataChannelOpen { label } => write!(f, "DataChannelOpen({})", label),
            TransportEvent::DataChannelMessage { label, .. } => {
                write!(f, "DataChannelMessage({})", label)
            }
            TransportEvent::DataChannelClose { label } => write!(f, "DataChannelClose({})", label),
            TransportEvent::DataChannelError { label, error } => {
                write!(f, "DataChannelError({}, {})", label, error)
            }
            TransportEvent::RemoteDataChannel { channel } => {
                write!(f, "RemoteDataChannel({})", channel.label())
            }
            TransportEvent::TrackAdded { mid, track, .. } => {
                write!(f, "TrackAdded(mid={:?}, track={})", mid, track.id())
            }
            TransportEvent::IceCandidate(c) => write!(f, "IceCandidate({:?})", c),
            TransportEvent::IceConnectionStateChanged(s) => {
                write!(f, "IceConnectionStateChanged({})", s)
            }
            TransportEvent::ConnectionStateChanged(s) => {
                write!(f, "ConnectionStateChanged({})", s.as_str())
            }
        }
    }
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Opaque DTLS certificate kept by the session across reconnects
#[derive(Clone)]
pub struct Certificate(pub Arc<dyn Any + Send + Sync>);

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Certificate(..)")
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn generate_certificate(&self) -> Result<Certificate>;

    /// Create a connection. Disposable connections (offer discovery,
    /// capability probing) are created without an event sender.
    async fn create(
        &self,
        certificate: &Certificate,
        events: Option<TransportEventSender>,
    ) -> Result<Arc<dyn PeerConnection>>;
}
