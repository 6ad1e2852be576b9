/// Client session
///
/// Owns the connection to the remote peer and everything negotiated over it:
/// the medias and their tracks, the data streams, the negotiation queue and
/// the control channel. All state sits behind one lock; inbound transport
/// events are handled by a single dispatch task per connection.
use super::dispatch;
use super::liveness::LivenessMonitor;
use super::negotiation::NegotiationQueue;
use crate::config::ClientConfig;
use crate::domain::handler::{MediaHandler, SessionHandler, StreamHandler};
use crate::domain::media::{Media, MediaInitOptions};
use crate::domain::path::{MediaPath, PathResolver, SubscribePath, TrackPath};
use crate::domain::shared::{Cname, Direction, MediaKind, PauseReason, Result, SessionError};
use crate::domain::track::{
    prepare_encodings, Encoding, MidPathMap, SendBinding, Track, TrackInfo,
};
use crate::domain::transport::{
    Certificate, ConnectionState, DataChannel, DataChannelOptions, IceCandidate, MediaStream,
    PeerConnection, PeerConnectionFactory, RawTrackRef, Transceiver, TransceiverInit,
};
use crate::infrastructure::bootstrap::{Bootstrap, BootstrapRequest, HttpBootstrap};
use crate::infrastructure::protocols::rpc::{
    ConsumeArgs, ControlChannel, NegotiationAck, PathArgs, ProduceArgs, RtpMetadata,
    SYSCALL_STREAM,
};
use crate::infrastructure::protocols::webrtc::sdp::IceCredentials;
use crate::infrastructure::protocols::webrtc::{ice_ufrag, SdpView};
use crate::infrastructure::telemetry;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Label of the data channel forcing a data section into discovery offers
const DISCOVERY_STREAM: &str = "dummy";

/// Remote track event waiting for its mid to be mapped
pub(super) struct ParkedTrack {
    pub(super) mid: String,
    pub(super) track: RawTrackRef,
    pub(super) transceiver: Option<Arc<dyn Transceiver>>,
    pub(super) stream_id: Option<String>,
}

pub(super) struct DataStream {
    pub(super) channel: Arc<dyn DataChannel>,
    pub(super) handler: StreamHandler,
    /// Opened by the remote peer
    pub(super) remote: bool,
}

/// Local offer built against a disposable connection
struct LocalOffer {
    sdp: String,
    mid_path_map: BTreeMap<String, String>,
    /// ssrc the offer announces for each discovered track
    ssrcs: Vec<(TrackPath, Option<String>)>,
    ice: Option<IceCredentials>,
}

pub(super) struct SessionState {
    pub(super) pc: Option<Arc<dyn PeerConnection>>,
    /// Kept across reconnects so the remote peer can correlate them
    pub(super) certificate: Option<Certificate>,
    /// Bumped on every teardown
    pub(super) epoch: u64,
    pub(super) generation: u64,
    pub(super) queue: NegotiationQueue,
    pub(super) handshaking: bool,
    pub(super) negotiated: bool,
    pub(super) medias: HashMap<MediaPath, Media>,
    pub(super) mid_path_map: MidPathMap,
    pub(super) parked: Vec<ParkedTrack>,
    pub(super) streams: HashMap<String, DataStream>,
    pub(super) syscall_channel: Option<Arc<dyn DataChannel>>,
    pub(super) control_ready: Option<watch::Sender<bool>>,
    pub(super) dispatcher: Option<JoinHandle<()>>,
    pub(super) reconnect_task: Option<JoinHandle<()>>,
    pub(super) reconnect_count: u64,
    pub(super) session_id: Option<String>,
    pub(super) local_ice: Option<IceCredentials>,
    pub(super) candidates: Vec<IceCandidate>,
    pub(super) candidates_complete: bool,
    pub(super) ice_state: Option<String>,
    pub(super) context: Option<Value>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            pc: None,
            certificate: None,
            epoch: 0,
            generation: 0,
            queue: NegotiationQueue::new(),
            handshaking: false,
            negotiated: false,
            medias: HashMap::new(),
            mid_path_map: MidPathMap::new(),
            parked: Vec::new(),
            streams: HashMap::new(),
            syscall_channel: None,
            control_ready: None,
            dispatcher: None,
            reconnect_task: None,
            reconnect_count: 0,
            session_id: None,
            local_ice: None,
            candidates: Vec::new(),
            candidates_complete: false,
            ice_state: None,
            context: None,
        }
    }

    pub(super) fn is_connected(&self) -> bool {
        self.pc.is_some()
    }

    /// Allocate a generation and snapshot the send tracks it covers
    pub(super) fn next_round(&mut self) -> (u64, Vec<TrackPath>) {
        self.generation += 1;
        (self.generation, self.send_track_paths())
    }

    pub(super) fn send_track_paths(&self) -> Vec<TrackPath> {
        self.medias
            .values()
            .filter(|m| !m.is_receiver())
            .flat_map(|m| m.track_paths())
            .collect()
    }

    /// Fail when a teardown happened since `epoch` was read
    pub(super) fn ensure_epoch(&self, epoch: u64) -> Result<()> {
        if self.epoch == epoch {
            Ok(())
        } else {
            Err(SessionError::InvalidState(
                "session closed during negotiation".to_string(),
            ))
        }
    }

    fn certificate(&self) -> Result<Certificate> {
        self.certificate
            .clone()
            .ok_or_else(|| SessionError::InvalidState("no certificate".to_string()))
    }

    /// Bindings of the send tracks in `only`, or of every send track
    fn send_bindings(&self, only: Option<&[TrackPath]>) -> Result<Vec<SendBinding>> {
        self.medias
            .values()
            .filter(|m| !m.is_receiver())
            .flat_map(|m| m.tracks())
            .filter(|t| only.map_or(true, |paths| paths.contains(t.path())))
            .map(Track::send_binding)
            .collect()
    }

    fn apply_discovery(&mut self, offer: &LocalOffer) {
        for (path, ssrc) in &offer.ssrcs {
            if let Some(track) = self.track_mut(path.as_str()) {
                track.set_ssrc(ssrc.clone());
            }
        }
    }

    pub(super) fn track(&self, path: &str) -> Option<&Track> {
        let media_path = PathResolver::track(path).ok()?.media_path();
        self.medias.get(media_path.as_str())?.track(path)
    }

    pub(super) fn track_mut(&mut self, path: &str) -> Option<&mut Track> {
        let media_path = PathResolver::track(path).ok()?.media_path();
        self.medias.get_mut(media_path.as_str())?.track_mut(path)
    }

    /// The media named by `path`: a media path, or a track path under it
    pub(super) fn media_for_mut(&mut self, path: &str) -> Option<&mut Media> {
        let key = if self.medias.contains_key(path) {
            path.to_string()
        } else {
            PathResolver::track(path).ok()?.media_path().as_str().to_string()
        };
        self.medias.get_mut(key.as_str())
    }

    /// Key of the media an application path refers to
    fn media_key(&self, path: &str) -> Option<MediaPath> {
        if let Some((key, _)) = self.medias.get_key_value(path) {
            return Some(key.clone());
        }
        let candidates = [
            PathResolver::publish(path).ok(),
            PathResolver::subscribe(path).ok().map(|t| t.media_path()),
        ];
        candidates
            .into_iter()
            .flatten()
            .find(|p| self.medias.contains_key(p.as_str()))
    }

    /// Close one track and drop its media once empty
    pub(super) async fn close_track(&mut self, path: &str, force: bool) -> bool {
        let Ok(track_path) = PathResolver::track(path) else {
            warn!("Cannot close {}: not a track path", path);
            return false;
        };
        let media_path = track_path.media_path();
        let pc = self.pc.clone();
        let Some(media) = self.medias.get_mut(media_path.as_str()) else {
            return false;
        };
        let closed = media.close_track(path, pc.as_deref(), force).await.is_some();
        if media.is_empty() {
            self.medias.remove(media_path.as_str());
            telemetry::update_active_medias(self.medias.len());
        }
        closed
    }

    /// Merge a mid → path map and attach the parked remote tracks it resolves.
    ///
    /// Returns the medias whose track the application rejected.
    pub(super) fn merge_mid_path_map(&mut self, map: HashMap<String, String>) -> Vec<MediaPath> {
        self.mid_path_map.extend(map);
        let mut vetoed = Vec::new();
        for parked in std::mem::take(&mut self.parked) {
            match self.mid_path_map.get(&parked.mid).cloned() {
                Some(path) => vetoed.extend(self.attach_remote_track(&path, parked)),
                None => self.parked.push(parked),
            }
        }
        vetoed
    }

    /// Bind a remote track to the receive track at `path` and open it.
    ///
    /// Returns the media path when `on_open` rejected the track.
    pub(super) fn attach_remote_track(
        &mut self,
        path: &str,
        parked: ParkedTrack,
    ) -> Option<MediaPath> {
        let Some(track) = self
            .track_mut(path)
            .filter(|t| t.direction() == Direction::Recv)
        else {
            debug!("No receive track at {} for mid {}", path, parked.mid);
            parked.track.stop();
            return None;
        };
        track.attach_remote(parked.track, parked.transceiver, parked.stream_id);
        let accepted = track.fire_open();
        let media_path = track.path().media_path();
        if let Some(media) = self.medias.get_mut(media_path.as_str()) {
            media.keep_alive();
        }
        debug!("Attached remote track {}", path);
        (accepted == Some(false)).then_some(media_path)
    }

    /// Remove the given tracks after a failed open/watch
    async fn rollback(&mut self, created: &[TrackPath]) {
        for path in created {
            debug!("Rolling back {}", path);
            self.close_track(path.as_str(), true).await;
        }
    }
}

pub(super) struct SessionInner {
    pub(super) config: ClientConfig,
    pub(super) cname: Cname,
    pub(super) factory: Arc<dyn PeerConnectionFactory>,
    pub(super) bootstrap: Arc<dyn Bootstrap>,
    pub(super) handler: SessionHandler,
    pub(super) rpc: ControlChannel,
    pub(super) liveness: LivenessMonitor,
    pub(super) state: Mutex<SessionState>,
}

/// Handle to a client session; clones share the session
#[derive(Clone)]
pub struct Session {
    pub(super) inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(
        config: ClientConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        bootstrap: Arc<dyn Bootstrap>,
        handler: SessionHandler,
    ) -> Self {
        let cname = config
            .cname
            .clone()
            .map(Cname::new)
            .unwrap_or_else(Cname::generate);
        telemetry::describe_metrics();
        info!("Created session {} for {}", cname, config.bootstrap_url);
        Self {
            inner: Arc::new(SessionInner {
                rpc: ControlChannel::new(config.max_msgid),
                liveness: LivenessMonitor::from_config(&config),
                cname,
                factory,
                bootstrap,
                handler,
                config,
                state: Mutex::new(SessionState::new()),
            }),
        }
    }

    /// Session bootstrapping over HTTP at `config.bootstrap_url`
    pub fn with_http(
        config: ClientConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        handler: SessionHandler,
    ) -> Self {
        let bootstrap = Arc::new(HttpBootstrap::new(config.bootstrap_url.clone()));
        Self::new(config, factory, bootstrap, handler)
    }

    pub fn cname(&self) -> &Cname {
        &self.inner.cname
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.state.lock().await.is_connected()
    }

    pub async fn is_negotiated(&self) -> bool {
        self.inner.state.lock().await.negotiated
    }

    /// Remote ICE username fragment of the current connection
    pub async fn session_id(&self) -> Option<String> {
        self.inner.state.lock().await.session_id.clone()
    }

    /// Value returned by the session `on_open` callback
    pub async fn context(&self) -> Option<Value> {
        self.inner.state.lock().await.context.clone()
    }

    pub async fn reconnect_count(&self) -> u64 {
        self.inner.state.lock().await.reconnect_count
    }

    pub async fn generation(&self) -> u64 {
        self.inner.state.lock().await.generation
    }

    pub async fn local_ice(&self) -> Option<IceCredentials> {
        self.inner.state.lock().await.local_ice.clone()
    }

    /// Gathered candidates of the first section, and whether gathering finished
    pub async fn local_candidates(&self) -> (Vec<IceCandidate>, bool) {
        let state = self.inner.state.lock().await;
        (state.candidates.clone(), state.candidates_complete)
    }

    pub async fn ice_state(&self) -> Option<String> {
        self.inner.state.lock().await.ice_state.clone()
    }

    pub async fn media_paths(&self) -> Vec<MediaPath> {
        let mut paths: Vec<_> = self.inner.state.lock().await.medias.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub async fn track_info(&self, path: &str) -> Option<TrackInfo> {
        self.inner
            .state
            .lock()
            .await
            .track_mut(path)
            .map(|t| t.info())
    }

    pub async fn stream_labels(&self) -> Vec<String> {
        let mut labels: Vec<_> = self.inner.state.lock().await.streams.keys().cloned().collect();
        labels.sort();
        labels
    }

    /// Connect to the remote peer. Does nothing when already connected.
    pub async fn connect(&self) -> Result<()> {
        let (ready, epoch) = {
            let mut state = self.inner.state.lock().await;
            if state.is_connected() {
                return Ok(());
            }
            let certificate = match state.certificate.clone() {
                Some(certificate) => certificate,
                None => {
                    let certificate = self.inner.factory.generate_certificate().await?;
                    state.certificate = Some(certificate.clone());
                    certificate
                }
            };
            let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
            let pc = self
                .inner
                .factory
                .create(&certificate, Some(events_tx))
                .await?;
            let (ready_tx, ready_rx) = watch::channel(false);
            state.pc = Some(pc);
            state.control_ready = Some(ready_tx);
            state.dispatcher = Some(dispatch::spawn(self.clone(), events_rx));
            (ready_rx, state.epoch)
        };

        info!("Connecting session {}", self.inner.cname);
        if let Err(e) = self.handshake(ready).await {
            warn!("Handshake of {} failed: {}", self.inner.cname, e);
            if self.inner.state.lock().await.epoch == epoch {
                self.teardown(false, false).await;
            }
            return Err(e);
        }
        Ok(())
    }

    async fn handshake(&self, mut ready: watch::Receiver<bool>) -> Result<()> {
        let (pc, certificate, epoch, generation, snapshot, bindings, modes) = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            if state.handshaking || state.negotiated {
                return Err(SessionError::InvalidState(
                    "handshake already performed".to_string(),
                ));
            }
            let pc = state
                .pc
                .clone()
                .ok_or_else(|| SessionError::InvalidState("not connected".to_string()))?;
            let certificate = state.certificate()?;
            state.handshaking = true;
            let (generation, snapshot) = state.next_round();
            let bindings = state.send_bindings(None)?;
            let modes = rid_modes(state.medias.values().filter(|m| !m.is_receiver()));
            (pc, certificate, state.epoch, generation, snapshot, bindings, modes)
        };

        let channel = pc
            .create_data_channel(SYSCALL_STREAM, DataChannelOptions::default())
            .await?;
        let offer = self.discover_offer(&certificate, &bindings).await?;
        let capability = self.probe_capability(&certificate).await?;
        {
            let mut state = self.inner.state.lock().await;
            state.ensure_epoch(epoch)?;
            state.syscall_channel = Some(channel);
            state.apply_discovery(&offer);
            state.local_ice = offer.ice.clone();
        }

        let response = self
            .inner
            .bootstrap
            .exchange(BootstrapRequest {
                sdp: offer.sdp,
                cname: self.inner.cname.to_string(),
                capability,
                rtp: (!modes.is_empty()).then(|| RtpMetadata {
                    rid_scalability_mode_map: modes,
                }),
            })
            .await?;
        let sdp = response.sdp.ok_or_else(|| {
            SessionError::Negotiation("bootstrap response carries no sdp".to_string())
        })?;

        let vetoed = {
            let mut state = self.inner.state.lock().await;
            state.ensure_epoch(epoch)?;
            state.session_id = ice_ufrag(&sdp);
            state.merge_mid_path_map(response.mid_media_path_map)
        };
        self.close_vetoed(vetoed);

        self.set_remote_offer(sdp, generation, snapshot).await?;
        ready
            .wait_for(|open| *open)
            .await
            .map_err(|_| SessionError::Transport("control channel closed".to_string()))?;

        let vetoed = {
            let mut state = self.inner.state.lock().await;
            state.ensure_epoch(epoch)?;
            state.negotiated = true;
            state.handshaking = false;
            state.context = self.inner.handler.on_open.as_ref().and_then(|f| f());
            let mut vetoed = Vec::new();
            for media in state.medias.values_mut().filter(|m| !m.is_receiver()) {
                for track in media.tracks_mut() {
                    if track.fire_open() == Some(false) {
                        vetoed.push(media_path_of(track));
                    }
                }
            }
            vetoed
        };
        self.close_vetoed(vetoed);
        info!("Session {} negotiated", self.inner.cname);
        Ok(())
    }

    /// Build the offer the live connection would make for `bindings`, using a
    /// disposable connection to learn mids and ssrcs.
    async fn discover_offer(
        &self,
        certificate: &Certificate,
        bindings: &[SendBinding],
    ) -> Result<LocalOffer> {
        let probe = self.inner.factory.create(certificate, None).await?;
        let offer = discover_with(probe.as_ref(), bindings).await;
        if let Err(e) = probe.close().await {
            debug!("Failed to close discovery connection: {}", e);
        }
        offer
    }

    /// Offer listing every codec the engine supports
    async fn probe_capability(&self, certificate: &Certificate) -> Result<String> {
        let probe = self.inner.factory.create(certificate, None).await?;
        let offer = async {
            for kind in [MediaKind::Audio, MediaKind::Video] {
                probe
                    .add_transceiver_from_kind(kind, TransceiverInit::recv_only())
                    .await?;
            }
            probe.create_offer().await
        }
        .await;
        if let Err(e) = probe.close().await {
            debug!("Failed to close capability connection: {}", e);
        }
        Ok(offer?.sdp)
    }

    /// Close the session and notify the remote peer
    pub async fn close(&self) {
        if let Some(task) = self.inner.state.lock().await.reconnect_task.take() {
            task.abort();
        }
        self.teardown(true, true).await;
    }

    /// Tear the connection down; `from_local` notifies the remote peer.
    ///
    /// Only the caller that takes the connection out of the state proceeds,
    /// so concurrent teardowns close once. With `reconnect`, the close
    /// callback (or the configured default) decides whether a reconnect is
    /// scheduled.
    pub(super) async fn teardown(&self, from_local: bool, reconnect: bool) {
        let (pc, streams, dispatcher) = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            let Some(pc) = state.pc.take() else {
                return;
            };
            state.epoch += 1;
            for media in state.medias.values_mut() {
                for path in media.track_paths() {
                    media.close_track(path.as_str(), Some(pc.as_ref()), true).await;
                }
            }
            for parked in state.parked.drain(..) {
                parked.track.stop();
            }
            let streams: Vec<_> = state.streams.drain().collect();
            let dispatcher = state.dispatcher.take();

            state.generation = 0;
            state.queue = NegotiationQueue::new();
            state.handshaking = false;
            state.negotiated = false;
            state.medias.clear();
            state.mid_path_map.clear();
            state.syscall_channel = None;
            state.control_ready = None;
            state.session_id = None;
            state.local_ice = None;
            state.candidates.clear();
            state.candidates_complete = false;
            state.ice_state = None;
            state.context = None;
            (pc, streams, dispatcher)
        };
        telemetry::update_active_medias(0);

        // the dispatcher still runs and routes the reply
        if from_local && self.inner.rpc.is_attached().await {
            let notice = self.inner.rpc.call("close", Value::Object(Default::default()));
            match tokio::time::timeout(self.inner.config.liveness_tick(), notice).await {
                Ok(Err(e)) => debug!("Close notification failed: {}", e),
                Err(_) => debug!("Close notification timed out"),
                Ok(Ok(_)) => {}
            }
        }

        let wait = if reconnect {
            match &self.inner.handler.on_close {
                None => Some(self.inner.config.reconnect_wait()),
                Some(f) => f()
                    .filter(|ns| *ns > 0)
                    .map(|ns| Duration::from_nanos(ns as u64)),
            }
        } else {
            None
        };

        for (label, stream) in streams {
            debug!(
                "Closing {} stream {}",
                if stream.remote { "remote" } else { "local" },
                label
            );
            if let Err(e) = stream.channel.close().await {
                debug!("Failed to close stream {}: {}", label, e);
            }
            if let Some(f) = &stream.handler.on_close {
                f(&label);
            }
        }
        self.inner.rpc.detach().await;
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
        }
        if pc.connection_state() != ConnectionState::Failed {
            if let Err(e) = pc.close().await {
                warn!("Failed to close connection: {}", e);
            }
        }
        info!("Session {} closed", self.inner.cname);

        if let Some(wait) = wait {
            self.schedule_reconnect(wait).await;
        }
    }

    async fn schedule_reconnect(&self, wait: Duration) {
        let task = self.spawn_reconnect(wait);
        let mut state = self.inner.state.lock().await;
        state.reconnect_count += 1;
        telemetry::record_reconnect_scheduled("session");
        info!(
            "Reconnecting {} in {:?} (attempt {})",
            self.inner.cname, wait, state.reconnect_count
        );
        if let Some(previous) = state.reconnect_task.replace(task) {
            previous.abort();
        }
    }

    /// Retry `connect` every `wait` until it succeeds
    fn spawn_reconnect(&self, wait: Duration) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(wait).await;
                match session.connect().await {
                    Ok(()) => break,
                    Err(e) => warn!("Reconnect of {} failed: {}", session.inner.cname, e),
                }
            }
        })
    }

    /// Publish `stream` under `path`.
    ///
    /// Before the session is connected the tracks are only registered; the
    /// next handshake publishes them.
    pub async fn open_media(
        &self,
        path: &str,
        stream: MediaStream,
        encodings: &[Encoding],
        handler: MediaHandler,
        options: MediaInitOptions,
    ) -> Result<()> {
        let media_path = PathResolver::publish(path)?;
        handler.validate(Direction::Send)?;
        let handler = Arc::new(handler);

        let mut kinds = Vec::new();
        for raw in &stream.tracks {
            if kinds.contains(&raw.kind()) {
                return Err(SessionError::Configuration(format!(
                    "more than one {} track in stream {}",
                    raw.kind(),
                    stream.id
                )));
            }
            kinds.push(raw.kind());
        }
        if kinds.is_empty() {
            return Err(SessionError::Configuration(format!(
                "stream {} has no track",
                stream.id
            )));
        }
        let (layers, modes) = if kinds.contains(&MediaKind::Video) {
            prepare_encodings(
                encodings,
                &self.inner.config.default_scalability_mode,
                self.inner.config.max_encodings,
            )?
        } else {
            (Vec::new(), BTreeMap::new())
        };

        let (created, round) = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            let media = state
                .medias
                .entry(media_path.clone())
                .or_insert_with(|| Media::new(media_path.clone(), Direction::Send, options.clone()));
            if media.is_receiver() {
                return Err(SessionError::Configuration(format!(
                    "{} is already watched",
                    media_path
                )));
            }
            let mut created = Vec::new();
            for raw in &stream.tracks {
                let kind = raw.kind();
                let track = Track::sender(
                    media_path.track(kind),
                    Some(stream.id.clone()),
                    raw.clone(),
                    if kind == MediaKind::Video { layers.clone() } else { Vec::new() },
                    handler.clone(),
                );
                if let Err(e) = media.add_track(track) {
                    state.rollback(&created).await;
                    return Err(e);
                }
                created.push(media_path.track(kind));
            }
            telemetry::update_active_medias(state.medias.len());

            if !state.is_connected() {
                debug!("Registered {} for the next handshake", media_path);
                return Ok(());
            }
            let prepared = state
                .send_bindings(Some(&created))
                .and_then(|bindings| state.certificate().map(|c| (bindings, c)));
            let (bindings, certificate) = match prepared {
                Ok(prepared) => prepared,
                Err(e) => {
                    state.rollback(&created).await;
                    return Err(e);
                }
            };
            let (generation, snapshot) = state.next_round();
            (created, (generation, snapshot, bindings, certificate, state.epoch))
        };
        let (generation, snapshot, bindings, certificate, epoch) = round;

        let offer = match self.discover_offer(&certificate, &bindings).await {
            Ok(offer) => offer,
            Err(e) => {
                self.inner.state.lock().await.rollback(&created).await;
                return Err(e);
            }
        };
        {
            let mut state = self.inner.state.lock().await;
            state.ensure_epoch(epoch)?;
            state.apply_discovery(&offer);
        }

        let produced = async {
            let args = ProduceArgs {
                sdp: offer.sdp,
                init_options: options,
                mid_path_map: offer.mid_path_map,
                rtp: RtpMetadata {
                    rid_scalability_mode_map: modes,
                },
            };
            let ack = self.inner.rpc.call("produce", args).await?;
            let sdp = negotiation_sdp(ack)?;
            self.set_remote_offer(sdp, generation, snapshot).await
        }
        .await;
        if let Err(e) = produced {
            warn!("Publishing {} failed: {}", media_path, e);
            self.inner.state.lock().await.rollback(&created).await;
            return Err(e);
        }

        let vetoed = {
            let mut state = self.inner.state.lock().await;
            let mut vetoed = Vec::new();
            for path in &created {
                if let Some(track) = state.track_mut(path.as_str()) {
                    if track.fire_open() == Some(false) {
                        vetoed.push(path.media_path());
                    }
                }
            }
            vetoed
        };
        self.close_vetoed(vetoed);
        info!("Published {}", media_path);
        Ok(())
    }

    /// Subscribe to `path`. With `options.sync` the existing tracks are
    /// re-attached instead of created.
    pub async fn watch_media(
        &self,
        path: &str,
        handler: MediaHandler,
        options: MediaInitOptions,
    ) -> Result<()> {
        let target = PathResolver::subscribe(path)?;
        handler.validate(Direction::Recv)?;
        self.consume(target, Some(Arc::new(handler)), options).await
    }

    /// Re-issue the subscription of a silent media
    pub(super) async fn resubscribe(&self, path: MediaPath, options: MediaInitOptions) {
        let target = {
            let state = self.inner.state.lock().await;
            let Some(media) = state.medias.get(path.as_str()) else {
                return;
            };
            match media.track_paths().as_slice() {
                [single] => SubscribePath::Track(single.clone()),
                _ => SubscribePath::Directory(path.clone()),
            }
        };
        telemetry::record_reconnect_scheduled("media");
        info!("Resubscribing {}", target.canonical());
        if let Err(e) = self.consume(target, None, options).await {
            warn!("Resubscribing {} failed: {}", path, e);
        }
    }

    async fn consume(
        &self,
        target: SubscribePath,
        handler: Option<Arc<MediaHandler>>,
        options: MediaInitOptions,
    ) -> Result<()> {
        let media_path = target.media_path();
        let (created, generation, snapshot) = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            if !state.is_connected() {
                return Err(SessionError::Transport("session is not connected".to_string()));
            }
            let mut created = Vec::new();
            if options.is_sync() {
                let synced = state
                    .medias
                    .get(media_path.as_str())
                    .map_or(false, |m| target.track_paths().iter().all(|p| m.track(p.as_str()).is_some()));
                if !synced {
                    return Err(SessionError::Resource(format!(
                        "no tracks to sync for {}",
                        target.canonical()
                    )));
                }
            } else {
                let handler = handler.ok_or_else(|| {
                    SessionError::Configuration("watch requires a handler".to_string())
                })?;
                let media = state
                    .medias
                    .entry(media_path.clone())
                    .or_insert_with(|| Media::new(media_path.clone(), Direction::Recv, options.clone()));
                if !media.is_receiver() {
                    return Err(SessionError::Configuration(format!(
                        "{} is published by this client",
                        media_path
                    )));
                }
                for path in target.track_paths() {
                    if let Err(e) = media.add_track(Track::receiver(path.clone(), handler.clone())) {
                        state.rollback(&created).await;
                        return Err(e);
                    }
                    created.push(path);
                }
                media.keep_alive();
                telemetry::update_active_medias(state.medias.len());
            }
            let (generation, snapshot) = state.next_round();
            (created, generation, snapshot)
        };

        let consumed = async {
            let args = ConsumeArgs {
                path: target.canonical().to_string(),
                init_options: options,
            };
            let ack = self.inner.rpc.call("consume", args).await?;
            let sdp = negotiation_sdp(ack)?;
            self.set_remote_offer(sdp, generation, snapshot).await
        }
        .await;
        if let Err(e) = consumed {
            warn!("Watching {} failed: {}", target.canonical(), e);
            self.inner.state.lock().await.rollback(&created).await;
            return Err(e);
        }
        info!("Watching {}", target.canonical());
        Ok(())
    }

    /// Pause the track at `path` on the remote peer, then locally
    pub async fn pause_media(&self, path: &str) -> Result<()> {
        let track_path = self.require_track(path).await?;
        self.inner
            .rpc
            .call("pause", PathArgs::new(track_path.as_str()))
            .await?;
        if let Some(track) = self.inner.state.lock().await.track_mut(track_path.as_str()) {
            track.pause(PauseReason::LocalOp, false);
        }
        Ok(())
    }

    pub async fn resume_media(&self, path: &str) -> Result<()> {
        let track_path = self.require_track(path).await?;
        self.inner
            .rpc
            .call("resume", PathArgs::new(track_path.as_str()))
            .await?;
        if let Some(track) = self.inner.state.lock().await.track_mut(track_path.as_str()) {
            track.resume(PauseReason::LocalOp, false);
        }
        Ok(())
    }

    /// Stop publishing or watching `path`
    pub async fn close_media(&self, path: &str) -> Result<()> {
        let (media_path, generation) = {
            let mut state = self.inner.state.lock().await;
            let media_path = state
                .media_key(path)
                .ok_or_else(|| SessionError::Resource(format!("no media for {}", path)))?;
            if !state.is_connected() {
                for track in state
                    .medias
                    .get(media_path.as_str())
                    .map(|m| m.track_paths())
                    .unwrap_or_default()
                {
                    state.close_track(track.as_str(), false).await;
                }
                return Ok(());
            }
            state.generation += 1;
            (media_path, state.generation)
        };

        let ack = self
            .inner
            .rpc
            .call("close_media", PathArgs::new(media_path.as_str()))
            .await?;
        let (sdp, snapshot) = {
            let mut state = self.inner.state.lock().await;
            let remaining = state
                .medias
                .get(media_path.as_str())
                .map(|m| m.track_paths())
                .unwrap_or_default();
            for track in remaining {
                state.close_track(track.as_str(), false).await;
            }
            let sdp = ack.get("sdp").and_then(Value::as_str).map(str::to_string);
            (sdp, state.send_track_paths())
        };
        if let Some(sdp) = sdp {
            self.set_remote_offer(sdp, generation, snapshot).await?;
        }
        info!("Closed {}", media_path);
        Ok(())
    }

    /// Replace the raw media of published tracks without renegotiation
    pub async fn update_media(&self, path: &str, stream: MediaStream) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let media_path = state
            .media_key(path)
            .ok_or_else(|| SessionError::Resource(format!("no media for {}", path)))?;
        let media = state
            .medias
            .get_mut(media_path.as_str())
            .ok_or_else(|| SessionError::Resource(format!("no media for {}", path)))?;
        if media.is_receiver() {
            return Err(SessionError::Configuration(format!(
                "{} is not published",
                media_path
            )));
        }
        for raw in stream.tracks {
            let track_path = media_path.track(raw.kind());
            let track = media.track_mut(track_path.as_str()).ok_or_else(|| {
                SessionError::Resource(format!("no track for {}", track_path))
            })?;
            track.update(Some(stream.id.clone()), raw).await?;
        }
        Ok(())
    }

    /// Call `function` on the remote peer
    pub async fn syscall(&self, function: &str, args: Value) -> Result<Value> {
        self.inner.rpc.call(function, args).await
    }

    /// Open (or reuse) the data stream labelled `path`
    pub async fn open_stream(&self, path: &str, handler: StreamHandler) -> Result<()> {
        handler.validate()?;
        let mut state = self.inner.state.lock().await;
        if state.streams.contains_key(path) {
            return Ok(());
        }
        let pc = state
            .pc
            .clone()
            .ok_or_else(|| SessionError::Transport("session is not connected".to_string()))?;
        let options = DataChannelOptions {
            ordered: handler.ordered,
            max_retransmits: handler.max_retransmits,
            protocol: None,
        };
        let channel = pc.create_data_channel(path, options).await?;
        debug!("Opening stream {}", path);
        state.streams.insert(
            path.to_string(),
            DataStream {
                channel,
                handler,
                remote: false,
            },
        );
        Ok(())
    }

    /// Receive the stream published by another client at `path`
    pub async fn watch_stream(&self, path: &str, handler: StreamHandler) -> Result<()> {
        self.open_stream(&format!("$watch/{}", path), handler).await
    }

    pub async fn close_stream(&self, path: &str) -> Result<()> {
        let stream = self
            .inner
            .state
            .lock()
            .await
            .streams
            .remove(path)
            .ok_or_else(|| SessionError::Resource(format!("no stream for {}", path)))?;
        if let Some(f) = &stream.handler.on_close {
            f(path);
        }
        stream.channel.close().await
    }

    pub async fn send_stream(&self, path: &str, text: impl Into<String>) -> Result<()> {
        let channel = self
            .inner
            .state
            .lock()
            .await
            .streams
            .get(path)
            .map(|s| s.channel.clone())
            .ok_or_else(|| SessionError::Resource(format!("no stream for {}", path)))?;
        channel.send_text(text.into()).await
    }

    async fn require_track(&self, path: &str) -> Result<TrackPath> {
        let mut state = self.inner.state.lock().await;
        PathResolver::track(path)
            .ok()
            .filter(|p| state.track_mut(p.as_str()).is_some())
            .ok_or_else(|| SessionError::Resource(format!("no media for {}", path)))
    }

    /// Close medias whose track the application rejected in `on_open`
    pub(super) fn close_vetoed(&self, medias: Vec<MediaPath>) {
        for path in medias {
            let session = self.clone();
            tokio::spawn(async move {
                if let Err(e) = session.close_media(path.as_str()).await {
                    warn!("Failed to close rejected media {}: {}", path, e);
                }
            });
        }
    }
}

fn media_path_of(track: &Track) -> MediaPath {
    track.path().media_path()
}

/// rid → scalability mode over every video send track
fn rid_modes<'a>(medias: impl Iterator<Item = &'a Media>) -> BTreeMap<String, String> {
    medias
        .flat_map(|m| m.tracks())
        .flat_map(|t| t.encodings())
        .filter_map(|e| Some((e.rid.clone()?, e.scalability_mode.clone()?)))
        .collect()
}

/// The remote offer carried by a `consume_ack`/`produce_ack`
fn negotiation_sdp(ack: Value) -> Result<String> {
    let ack: NegotiationAck = serde_json::from_value(ack)?;
    ack.sdp
        .ok_or_else(|| SessionError::Negotiation("no sdp in response".to_string()))
}

/// Place `bindings` on `probe`, create the offer and read back mids and ssrcs
async fn discover_with(probe: &dyn PeerConnection, bindings: &[SendBinding]) -> Result<LocalOffer> {
    probe
        .create_data_channel(DISCOVERY_STREAM, DataChannelOptions::default())
        .await?;
    let mut placed = Vec::with_capacity(bindings.len());
    for binding in bindings {
        placed.push((binding.path().clone(), binding.add_to(probe).await?));
    }
    let offer = probe.create_offer().await?;
    probe.set_local_description(offer.clone()).await?;

    let view = SdpView::parse(&offer.sdp)?;
    let announced = view.mid_ssrc_map();
    let mut mid_path_map = BTreeMap::new();
    let mut ssrcs = Vec::with_capacity(placed.len());
    for (path, transceiver) in placed {
        let Some(mid) = transceiver.mid() else {
            continue;
        };
        ssrcs.push((path.clone(), announced.get(&mid).cloned()));
        mid_path_map.insert(mid, path.to_string());
    }
    Ok(LocalOffer {
        sdp: offer.sdp,
        mid_path_map,
        ssrcs,
        ice: view.ice,
    })
}
