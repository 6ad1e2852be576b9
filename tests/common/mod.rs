//! In-memory engine, bootstrap endpoint and remote peer for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use pathcast::domain::handler::{MediaHandler, ReconnectHint, SessionHandler};
use pathcast::domain::shared::{MediaKind, Result};
use pathcast::domain::transport::{
    Certificate, ConnectionState, DataChannel, DataChannelOptions, PeerConnection,
    PeerConnectionFactory, RawTrack, RawTrackRef, SdpType, SendParameters, SessionDescription,
    StreamMessage, Transceiver, TransceiverDirection, TransceiverInit, TransportEvent,
    TransportEventSender,
};
use pathcast::infrastructure::bootstrap::{Bootstrap, BootstrapRequest, BootstrapResponse};
use pathcast::infrastructure::protocols::rpc::SyscallMessage;
use pathcast::{ClientConfig, Session};
use serde_json::{json, Value};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Poll `$cond` until it holds, failing the test after ~3 seconds
macro_rules! eventually {
    ($cond:expr) => {{
        let mut reached = false;
        for _ in 0..300 {
            if $cond {
                reached = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(reached, "condition never held: {}", stringify!($cond));
    }};
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

const HEADER: &str = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

/// Remote offer with a data section and one section per `(mid, kind, sending)`.
///
/// Sending sections make the fake engine raise a track event when applied.
pub fn remote_offer(sections: &[(&str, MediaKind, bool)]) -> String {
    let mut sdp = format!(
        "{}a=ice-ufrag:remote-session\r\na=ice-pwd:remotepassword\r\n\
         m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=mid:0\r\n",
        HEADER
    );
    for (mid, kind, sending) in sections {
        sdp.push_str(&format!("m={} 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:{}\r\n", kind, mid));
        sdp.push_str(if *sending { "a=sendonly\r\n" } else { "a=recvonly\r\n" });
    }
    sdp
}

pub fn path_map(entries: &[(&str, &str)]) -> Value {
    Value::Object(
        entries
            .iter()
            .map(|(mid, path)| (mid.to_string(), json!(path)))
            .collect(),
    )
}

#[derive(Debug)]
pub struct FakeRawTrack {
    id: String,
    kind: MediaKind,
    ssrc: u32,
    stopped: AtomicBool,
}

impl FakeRawTrack {
    pub fn new(kind: MediaKind, ssrc: u32) -> Arc<Self> {
        Arc::new(Self {
            id: format!("{}-{}", kind, ssrc),
            kind,
            ssrc,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl RawTrack for FakeRawTrack {
    fn id(&self) -> String {
        self.id.clone()
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

fn raw_ssrc(raw: &RawTrackRef) -> Option<u32> {
    raw.as_any().downcast_ref::<FakeRawTrack>().map(|r| r.ssrc)
}

pub struct FakeTransceiver {
    mid: StdMutex<Option<String>>,
    kind: MediaKind,
    direction: StdMutex<TransceiverDirection>,
    track: StdMutex<Option<RawTrackRef>>,
    parameters: StdMutex<SendParameters>,
}

impl FakeTransceiver {
    fn new(kind: MediaKind, mid: Option<String>, direction: TransceiverDirection) -> Arc<Self> {
        Arc::new(Self {
            mid: StdMutex::new(mid),
            kind,
            direction: StdMutex::new(direction),
            track: StdMutex::new(None),
            parameters: StdMutex::new(SendParameters::default()),
        })
    }

    fn sending_ssrc(&self) -> Option<u32> {
        match *self.direction.lock().unwrap() {
            TransceiverDirection::SendOnly | TransceiverDirection::SendRecv => {
                self.track.lock().unwrap().as_ref().and_then(raw_ssrc)
            }
            _ => None,
        }
    }

    pub fn direction(&self) -> TransceiverDirection {
        *self.direction.lock().unwrap()
    }

    pub fn encodings(&self) -> usize {
        self.parameters.lock().unwrap().encodings.len()
    }
}

#[async_trait]
impl Transceiver for FakeTransceiver {
    fn mid(&self) -> Option<String> {
        self.mid.lock().unwrap().clone()
    }
    fn has_sender(&self) -> bool {
        true
    }
    async fn set_direction(&self, direction: TransceiverDirection) -> Result<()> {
        *self.direction.lock().unwrap() = direction;
        Ok(())
    }
    async fn replace_track(&self, track: Option<RawTrackRef>) -> Result<()> {
        *self.track.lock().unwrap() = track;
        Ok(())
    }
    async fn get_parameters(&self) -> Result<SendParameters> {
        Ok(self.parameters.lock().unwrap().clone())
    }
    async fn set_parameters(&self, parameters: SendParameters) -> Result<()> {
        *self.parameters.lock().unwrap() = parameters;
        Ok(())
    }
}

pub struct FakeChannel {
    label: String,
    frames: mpsc::UnboundedSender<SyscallMessage>,
    sent: StdMutex<Vec<String>>,
    opened: AtomicBool,
    closed: AtomicBool,
}

impl FakeChannel {
    pub fn new(label: &str, frames: mpsc::UnboundedSender<SyscallMessage>) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            frames,
            sent: StdMutex::new(Vec::new()),
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannel for FakeChannel {
    fn label(&self) -> String {
        self.label.clone()
    }
    async fn send_text(&self, text: String) -> Result<()> {
        if self.label == "$syscall" {
            let _ = self.frames.send(SyscallMessage::parse(&text)?);
        } else {
            self.sent.lock().unwrap().push(text);
        }
        Ok(())
    }
    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakePeerConnection {
    events: Option<TransportEventSender>,
    frames: mpsc::UnboundedSender<SyscallMessage>,
    ssrc_offset: Arc<AtomicU32>,
    transceivers: StdMutex<Vec<Arc<FakeTransceiver>>>,
    channels: StdMutex<Vec<Arc<FakeChannel>>>,
    next_mid: AtomicUsize,
    established: AtomicBool,
    state: StdMutex<ConnectionState>,
    removed: StdMutex<Vec<String>>,
}

impl FakePeerConnection {
    fn new(
        events: Option<TransportEventSender>,
        frames: mpsc::UnboundedSender<SyscallMessage>,
        ssrc_offset: Arc<AtomicU32>,
    ) -> Self {
        Self {
            events,
            frames,
            ssrc_offset,
            transceivers: StdMutex::new(Vec::new()),
            channels: StdMutex::new(Vec::new()),
            next_mid: AtomicUsize::new(1),
            established: AtomicBool::new(false),
            state: StdMutex::new(ConnectionState::New),
            removed: StdMutex::new(Vec::new()),
        }
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Mids whose sender was removed
    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    pub fn transceiver(&self, mid: &str) -> Option<Arc<FakeTransceiver>> {
        self.transceivers
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.mid().as_deref() == Some(mid))
            .cloned()
    }

    pub fn channel(&self, label: &str) -> Option<Arc<FakeChannel>> {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.label == label)
            .cloned()
    }

    pub fn is_closed(&self) -> bool {
        *self.state.lock().unwrap() == ConnectionState::Closed
    }

    fn media_sections(&self, offset: u32) -> String {
        let mut transceivers: Vec<_> = self.transceivers.lock().unwrap().clone();
        transceivers.sort_by_key(|t| t.mid().and_then(|m| m.parse::<u32>().ok()));
        let mut sdp = String::new();
        for t in transceivers {
            let Some(mid) = t.mid() else { continue };
            sdp.push_str(&format!("m={} 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:{}\r\n", t.kind, mid));
            if let Some(ssrc) = t.sending_ssrc() {
                sdp.push_str(&format!("a=ssrc:{} cname:fake\r\n", ssrc + offset));
            }
        }
        sdp
    }

    fn local_header(&self) -> String {
        let mut sdp = format!("{}a=ice-ufrag:local\r\na=ice-pwd:localpassword\r\n", HEADER);
        if !self.channels.lock().unwrap().is_empty() {
            sdp.push_str("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=mid:0\r\n");
        }
        sdp
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        for t in self.transceivers.lock().unwrap().iter() {
            let mut mid = t.mid.lock().unwrap();
            if mid.is_none() {
                *mid = Some(self.next_mid.fetch_add(1, Ordering::SeqCst).to_string());
            }
        }
        Ok(SessionDescription::offer(format!(
            "{}{}",
            self.local_header(),
            self.media_sections(0)
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let offset = self.ssrc_offset.load(Ordering::SeqCst);
        Ok(SessionDescription::answer(format!(
            "{}{}",
            self.local_header(),
            self.media_sections(offset)
        )))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        if description.sdp_type != SdpType::Answer || self.events.is_none() {
            return Ok(());
        }
        self.established.store(true, Ordering::SeqCst);
        *self.state.lock().unwrap() = ConnectionState::Connected;
        let channels: Vec<_> = self.channels.lock().unwrap().clone();
        for channel in channels {
            if !channel.opened.swap(true, Ordering::SeqCst) {
                self.emit(TransportEvent::DataChannelOpen {
                    label: channel.label.clone(),
                });
            }
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let mut sections = Vec::new();
        let mut current: Option<(Option<MediaKind>, Option<String>, bool)> = None;
        for line in description.sdp.lines().map(str::trim_end) {
            if let Some(m) = line.strip_prefix("m=") {
                sections.extend(current.take());
                let kind = MediaKind::from_str_opt(m.split_whitespace().next().unwrap_or(""));
                current = Some((kind, None, false));
            } else if let (Some(mid), Some(section)) = (line.strip_prefix("a=mid:"), current.as_mut()) {
                section.1 = Some(mid.to_string());
            } else if let (true, Some(section)) = (line == "a=sendonly", current.as_mut()) {
                section.2 = true;
            }
        }
        sections.extend(current);

        for (kind, mid, sending) in sections {
            let (Some(kind), Some(mid)) = (kind, mid) else { continue };
            if self.transceiver(&mid).is_some() {
                continue;
            }
            let transceiver =
                FakeTransceiver::new(kind, Some(mid.clone()), TransceiverDirection::RecvOnly);
            self.transceivers.lock().unwrap().push(transceiver.clone());
            if sending {
                self.emit(TransportEvent::TrackAdded {
                    mid: Some(mid),
                    track: FakeRawTrack::new(kind, 0),
                    transceiver: Some(transceiver),
                    stream_id: Some("remote".to_string()),
                });
            }
        }
        Ok(())
    }

    async fn add_transceiver_from_track(
        &self,
        track: RawTrackRef,
        init: TransceiverInit,
    ) -> Result<Arc<dyn Transceiver>> {
        let transceiver = FakeTransceiver::new(track.kind(), None, init.direction);
        *transceiver.track.lock().unwrap() = Some(track);
        transceiver.parameters.lock().unwrap().encodings = init.send_encodings;
        self.transceivers.lock().unwrap().push(transceiver.clone());
        Ok(transceiver)
    }

    async fn add_transceiver_from_kind(
        &self,
        kind: MediaKind,
        init: TransceiverInit,
    ) -> Result<Arc<dyn Transceiver>> {
        let transceiver = FakeTransceiver::new(kind, None, init.direction);
        self.transceivers.lock().unwrap().push(transceiver.clone());
        Ok(transceiver)
    }

    async fn transceivers(&self) -> Vec<Arc<dyn Transceiver>> {
        self.transceivers
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.clone() as Arc<dyn Transceiver>)
            .collect()
    }

    async fn remove_track(&self, transceiver: &Arc<dyn Transceiver>) -> Result<()> {
        let Some(mid) = transceiver.mid() else {
            return Ok(());
        };
        if let Some(own) = self.transceiver(&mid) {
            *own.track.lock().unwrap() = None;
            self.removed.lock().unwrap().push(mid);
        }
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        _options: DataChannelOptions,
    ) -> Result<Arc<dyn DataChannel>> {
        let channel = FakeChannel::new(label, self.frames.clone());
        self.channels.lock().unwrap().push(channel.clone());
        if self.established.load(Ordering::SeqCst) {
            channel.opened.store(true, Ordering::SeqCst);
            self.emit(TransportEvent::DataChannelOpen {
                label: label.to_string(),
            });
        }
        Ok(channel)
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    async fn close(&self) -> Result<()> {
        *self.state.lock().unwrap() = ConnectionState::Closed;
        Ok(())
    }
}

struct EngineState {
    events: StdMutex<Option<TransportEventSender>>,
    live: StdMutex<Option<Arc<FakePeerConnection>>>,
    frames_tx: mpsc::UnboundedSender<SyscallMessage>,
    frames_rx: Mutex<mpsc::UnboundedReceiver<SyscallMessage>>,
    ssrc_offset: Arc<AtomicU32>,
    connections: AtomicUsize,
    probes: AtomicUsize,
}

/// Engine factory doubling as the remote peer's end of the control channel
#[derive(Clone)]
pub struct FakeEngine {
    inner: Arc<EngineState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(EngineState {
                events: StdMutex::new(None),
                live: StdMutex::new(None),
                frames_tx,
                frames_rx: Mutex::new(frames_rx),
                ssrc_offset: Arc::new(AtomicU32::new(0)),
                connections: AtomicUsize::new(0),
                probes: AtomicUsize::new(0),
            }),
        }
    }

    /// Connections created with an event sender
    pub fn connections(&self) -> usize {
        self.inner.connections.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.inner.probes.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> Arc<FakePeerConnection> {
        self.inner
            .live
            .lock()
            .unwrap()
            .clone()
            .expect("no live connection")
    }

    /// Shift the ssrcs the live connection puts in its answers
    pub fn set_ssrc_offset(&self, offset: u32) {
        self.inner.ssrc_offset.store(offset, Ordering::SeqCst);
    }

    pub fn inject(&self, event: TransportEvent) {
        if let Some(events) = self.inner.events.lock().unwrap().as_ref() {
            let _ = events.send(event);
        }
    }

    /// Next frame the session sent on the control channel, pings skipped
    pub async fn next_frame(&self) -> SyscallMessage {
        let mut frames = self.inner.frames_rx.lock().await;
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), frames.recv())
                .await
                .expect("no control frame within 5s")
                .expect("control frame channel closed");
            if frame.function != "ping" {
                return frame;
            }
        }
    }

    pub fn reply(&self, frame: &SyscallMessage, args: Value) {
        let text = json!({
            "fn": format!("{}_ack", frame.function),
            "msgid": frame.msgid,
            "args": args,
        });
        self.send_control(text);
    }

    pub fn notify(&self, function: &str, args: Value) {
        self.send_control(json!({"fn": function, "args": args}));
    }

    pub fn send_control(&self, frame: Value) {
        self.inject(TransportEvent::DataChannelMessage {
            label: "$syscall".to_string(),
            message: StreamMessage::Text(frame.to_string()),
        });
    }
}

#[async_trait]
impl PeerConnectionFactory for FakeEngine {
    async fn generate_certificate(&self) -> Result<Certificate> {
        Ok(Certificate(Arc::new(())))
    }

    async fn create(
        &self,
        _certificate: &Certificate,
        events: Option<TransportEventSender>,
    ) -> Result<Arc<dyn PeerConnection>> {
        let pc = Arc::new(FakePeerConnection::new(
            events.clone(),
            self.inner.frames_tx.clone(),
            self.inner.ssrc_offset.clone(),
        ));
        match events {
            Some(events) => {
                *self.inner.events.lock().unwrap() = Some(events);
                *self.inner.live.lock().unwrap() = Some(pc.clone());
                self.inner.connections.fetch_add(1, Ordering::SeqCst);
            }
            None => {
                self.inner.probes.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(pc)
    }
}

/// Bootstrap endpoint answering every request with a configured response
pub struct FakeBootstrap {
    response: StdMutex<BootstrapResponse>,
    requests: StdMutex<Vec<BootstrapRequest>>,
}

impl FakeBootstrap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            response: StdMutex::new(BootstrapResponse {
                sdp: Some(remote_offer(&[])),
                mid_media_path_map: HashMap::new(),
            }),
            requests: StdMutex::new(Vec::new()),
        })
    }

    pub fn respond_with(&self, sdp: Option<String>, map: &[(&str, &str)]) {
        *self.response.lock().unwrap() = BootstrapResponse {
            sdp,
            mid_media_path_map: map
                .iter()
                .map(|(mid, path)| (mid.to_string(), path.to_string()))
                .collect(),
        };
    }

    pub fn requests(&self) -> Vec<BootstrapRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Bootstrap for FakeBootstrap {
    async fn exchange(&self, request: BootstrapRequest) -> Result<BootstrapResponse> {
        self.requests.lock().unwrap().push(request);
        Ok(self.response.lock().unwrap().clone())
    }
}

pub fn config() -> ClientConfig {
    ClientConfig {
        cname: Some("tester".to_string()),
        ..ClientConfig::default()
    }
}

pub fn session(engine: &FakeEngine, bootstrap: &Arc<FakeBootstrap>, handler: SessionHandler) -> Session {
    Session::new(config(), Arc::new(engine.clone()), bootstrap.clone(), handler)
}

/// Records every track callback as `"<event> <path>"`
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<StdMutex<Vec<String>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn media_handler(&self) -> MediaHandler {
        self.media_handler_with(true, ReconnectHint::Default)
    }

    pub fn media_handler_with(&self, accept: bool, hint: ReconnectHint) -> MediaHandler {
        let (open, close, pause, resume) = (self.clone(), self.clone(), self.clone(), self.clone());
        MediaHandler::new()
            .on_open(move |info| {
                open.push(format!("open {}", info.path));
                accept
            })
            .on_close(move |info| close.push(format!("close {}", info.path)))
            .on_pause(move |info, reason| {
                pause.push(format!("pause {} {}", info.path, reason));
                hint
            })
            .on_resume(move |info, reason| resume.push(format!("resume {} {}", info.path, reason)))
    }

    pub fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }
}
