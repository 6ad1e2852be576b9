//! Track entity
//!
//! A track is one directional media flow bound to a canonical track path.
//! Send tracks own the captured raw handle and are placed on a transceiver in
//! two steps: discovery (against a disposable connection, to learn mid and
//! ssrc for the offer) and commit (against the live connection, once the
//! remote peer decided the mids). Both run on a [`SendBinding`] so the
//! session state is not borrowed across engine calls.

use crate::domain::handler::{MediaHandler, ReconnectHint};
use crate::domain::path::TrackPath;
use crate::domain::shared::{Direction, MediaKind, PauseReason, Result, SessionError};
use crate::domain::transport::{
    PeerConnection, RawTrackRef, Transceiver, TransceiverDirection, TransceiverInit,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// mid → track path, as decided by the remote peer
pub type MidPathMap = HashMap<String, String>;

/// One simulcast/SVC layer of a video send track
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Encoding {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scalability_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale_resolution_down_by: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_framerate: Option<f64>,
}

impl Encoding {
    pub fn with_bitrate(max_bitrate: u64) -> Self {
        Self {
            max_bitrate: Some(max_bitrate),
            ..Self::default()
        }
    }

    pub fn scalability_mode(mut self, mode: impl Into<String>) -> Self {
        self.scalability_mode = Some(mode.into());
        self
    }
}

/// Validate publish encodings, assign rids and order them by ascending bitrate.
///
/// The remote peer treats earlier layers as lower quality regardless of the
/// actual bitrate, hence the ordering. Returns the prepared layers and the
/// rid → scalability mode map sent along with the offer.
pub fn prepare_encodings(
    encodings: &[Encoding],
    default_mode: &str,
    max_layers: usize,
) -> Result<(Vec<Encoding>, BTreeMap<String, String>)> {
    if encodings.is_empty() {
        return Err(SessionError::Configuration(
            "encodings is mandatory".to_string(),
        ));
    }
    if encodings.len() > max_layers {
        return Err(SessionError::Configuration(format!(
            "encodings more than {} may not be treated correctly",
            max_layers
        )));
    }

    let mut prepared = Vec::with_capacity(encodings.len());
    let mut modes = BTreeMap::new();
    for (index, encoding) in encodings.iter().enumerate() {
        if encoding.max_bitrate.unwrap_or(0) == 0 {
            return Err(SessionError::Configuration(
                "for each encodings, max_bitrate is mandatory".to_string(),
            ));
        }
        if encoding.rid.is_some() {
            return Err(SessionError::Configuration(
                "cannot specify rid for encodings".to_string(),
            ));
        }
        let rid = format!("r{}", index);
        let mode = encoding
            .scalability_mode
            .clone()
            .unwrap_or_else(|| default_mode.to_string());
        modes.insert(rid.clone(), mode.clone());
        prepared.push(Encoding {
            rid: Some(rid),
            scalability_mode: Some(mode),
            ..encoding.clone()
        });
    }
    prepared.sort_by_key(|e| e.max_bitrate.unwrap_or(0));
    Ok((prepared, modes))
}

/// Read-only view of a track handed to application callbacks
#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub path: TrackPath,
    pub kind: MediaKind,
    pub direction: Direction,
    pub mid: Option<String>,
    pub ssrc: Option<String>,
    pub stream_id: Option<String>,
    pub raw: Option<RawTrackRef>,
    pub opened: bool,
    pub paused_reasons: Vec<PauseReason>,
}

impl TrackInfo {
    pub fn paused(&self) -> bool {
        !self.paused_reasons.is_empty()
    }

    /// Publisher of a received track
    pub fn cname(&self) -> Option<&str> {
        match self.direction {
            Direction::Recv => Some(self.path.cname()),
            Direction::Send => None,
        }
    }
}

/// A send track's raw handle and layers, placed on a connection without
/// borrowing the track itself
#[derive(Clone)]
pub struct SendBinding {
    path: TrackPath,
    raw: RawTrackRef,
    stream_id: Option<String>,
    encodings: Vec<Encoding>,
}

impl SendBinding {
    pub fn path(&self) -> &TrackPath {
        &self.path
    }

    /// Add a fresh send-only transceiver (discovery)
    pub async fn add_to(&self, pc: &dyn PeerConnection) -> Result<Arc<dyn Transceiver>> {
        let mut init = TransceiverInit::send_only(self.stream_id.clone());
        if self.raw.kind() == MediaKind::Video {
            init.send_encodings = self.encodings.clone();
        }
        pc.add_transceiver_from_track(self.raw.clone(), init).await
    }

    /// Reuse the transceiver whose remote-decided mid maps to this track (commit)
    pub async fn commit_on(
        &self,
        pc: &dyn PeerConnection,
        mid_path_map: &MidPathMap,
    ) -> Result<Arc<dyn Transceiver>> {
        let mut found = None;
        for transceiver in pc.transceivers().await {
            if !transceiver.has_sender() {
                continue;
            }
            let Some(mid) = transceiver.mid() else {
                continue;
            };
            match mid_path_map.get(&mid) {
                Some(path) if path == self.path.as_str() => {
                    found = Some(transceiver);
                    break;
                }
                Some(_) => {}
                None => debug!("No path for mid {}", mid),
            }
        }
        let transceiver = found.ok_or_else(|| {
            SessionError::Negotiation(format!("no corresponding transceiver: {}", self.path))
        })?;

        transceiver.set_direction(TransceiverDirection::SendOnly).await?;
        if self.raw.kind() == MediaKind::Video {
            let mut parameters = transceiver.get_parameters().await?;
            parameters.encodings = self.encodings.clone();
            transceiver.set_parameters(parameters).await?;
        }
        transceiver.replace_track(Some(self.raw.clone())).await?;
        Ok(transceiver)
    }
}

pub struct Track {
    path: TrackPath,
    direction: Direction,
    stream_id: Option<String>,
    raw: Option<RawTrackRef>,
    encodings: Vec<Encoding>,
    handler: Arc<MediaHandler>,
    opened: bool,
    paused_reasons: BTreeSet<PauseReason>,
    transceiver: Option<Arc<dyn Transceiver>>,
    ssrc: Option<String>,
}

impl Track {
    /// Send track carrying a captured raw handle
    pub fn sender(
        path: TrackPath,
        stream_id: Option<String>,
        raw: RawTrackRef,
        encodings: Vec<Encoding>,
        handler: Arc<MediaHandler>,
    ) -> Self {
        Self {
            path,
            direction: Direction::Send,
            stream_id,
            raw: Some(raw),
            encodings,
            handler,
            opened: false,
            paused_reasons: BTreeSet::new(),
            transceiver: None,
            ssrc: None,
        }
    }

    /// Receive track; the raw handle arrives with the remote track event
    pub fn receiver(path: TrackPath, handler: Arc<MediaHandler>) -> Self {
        Self {
            path,
            direction: Direction::Recv,
            stream_id: None,
            raw: None,
            encodings: Vec::new(),
            handler,
            opened: false,
            paused_reasons: BTreeSet::new(),
            transceiver: None,
            ssrc: None,
        }
    }

    pub fn path(&self) -> &TrackPath {
        &self.path
    }

    pub fn kind(&self) -> MediaKind {
        self.path.kind()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn mid(&self) -> Option<String> {
        self.transceiver.as_ref().and_then(|t| t.mid())
    }

    pub fn ssrc(&self) -> Option<&str> {
        self.ssrc.as_deref()
    }

    pub fn set_ssrc(&mut self, ssrc: Option<String>) {
        self.ssrc = ssrc;
    }

    pub fn raw(&self) -> Option<&RawTrackRef> {
        self.raw.as_ref()
    }

    pub fn encodings(&self) -> &[Encoding] {
        &self.encodings
    }

    /// A track is active while it holds a raw handle
    pub fn is_active(&self) -> bool {
        self.raw.is_some()
    }

    pub fn is_opened(&self) -> bool {
        self.opened
    }

    pub fn is_paused(&self) -> bool {
        !self.paused_reasons.is_empty()
    }

    pub fn paused_by(&self, reason: PauseReason) -> bool {
        self.paused_reasons.contains(&reason)
    }

    pub fn info(&self) -> TrackInfo {
        TrackInfo {
            path: self.path.clone(),
            kind: self.kind(),
            direction: self.direction,
            mid: self.mid(),
            ssrc: self.ssrc.clone(),
            stream_id: self.stream_id.clone(),
            raw: self.raw.clone(),
            opened: self.opened,
            paused_reasons: self.paused_reasons.iter().copied().collect(),
        }
    }

    /// Detach what placing this send track on a connection needs
    pub fn send_binding(&self) -> Result<SendBinding> {
        match (self.direction, &self.raw) {
            (Direction::Send, Some(raw)) => Ok(SendBinding {
                path: self.path.clone(),
                raw: raw.clone(),
                stream_id: self.stream_id.clone(),
                encodings: self.encodings.clone(),
            }),
            _ => Err(SessionError::Negotiation(format!(
                "open is only needed for send tracks: {}",
                self.path
            ))),
        }
    }

    /// Adopt the transceiver a [`SendBinding`] committed on the live connection
    pub fn bind(&mut self, transceiver: Arc<dyn Transceiver>) {
        self.transceiver = Some(transceiver);
    }

    /// Bind the remote raw handle of a receive track
    pub fn attach_remote(
        &mut self,
        raw: RawTrackRef,
        transceiver: Option<Arc<dyn Transceiver>>,
        stream_id: Option<String>,
    ) {
        if self.direction != Direction::Recv {
            return;
        }
        self.raw = Some(raw);
        self.transceiver = transceiver;
        self.stream_id = stream_id;
    }

    /// Mark the track opened and run `on_open` once.
    ///
    /// Returns `None` when the track was already opened, otherwise whether the
    /// application accepted it.
    pub fn fire_open(&mut self) -> Option<bool> {
        if self.opened {
            return None;
        }
        self.opened = true;
        let info = self.info();
        Some(self.handler.on_open.as_ref().map_or(true, |f| f(&info)))
    }

    /// Add a pause reason; adding a present reason only repeats the callback
    pub fn pause(&mut self, reason: PauseReason, no_callback: bool) -> ReconnectHint {
        self.paused_reasons.insert(reason);
        if no_callback {
            return ReconnectHint::Default;
        }
        match &self.handler.on_pause {
            Some(f) => f(&self.info(), reason),
            None => ReconnectHint::Default,
        }
    }

    /// Remove a pause reason; the callback runs only when it was present
    pub fn resume(&mut self, reason: PauseReason, no_callback: bool) {
        if !self.paused_reasons.remove(&reason) || no_callback {
            return;
        }
        if let Some(f) = &self.handler.on_resume {
            f(&self.info(), reason);
        }
    }

    /// Swap the raw handle of an opened send track without renegotiation
    pub async fn update(&mut self, stream_id: Option<String>, raw: RawTrackRef) -> Result<()> {
        let transceiver = self.transceiver.clone().ok_or_else(|| {
            SessionError::InvalidState(format!("track is not started: {}", self.path))
        })?;
        transceiver.replace_track(Some(raw.clone())).await?;
        if let Some(previous) = self.raw.replace(raw) {
            previous.stop();
        }
        self.stream_id = stream_id;
        if let Some(f) = &self.handler.on_update {
            f(&self.info());
        }
        Ok(())
    }

    /// Release the track. Idempotent.
    ///
    /// Receive tracks keep their raw handle running unless `force` is set: a
    /// stopped receiver cannot be reused by the engine when the same section
    /// is renegotiated later.
    pub async fn close(&mut self, pc: Option<&dyn PeerConnection>, force: bool) {
        if self.raw.is_none() {
            return;
        }
        if let Some(f) = &self.handler.on_close {
            f(&self.info());
        }
        if let Some(raw) = self.raw.take() {
            if force || self.direction == Direction::Send {
                if let (Some(pc), Some(transceiver)) = (pc, &self.transceiver) {
                    if transceiver.mid().is_some() {
                        if let Err(e) = pc.remove_track(transceiver).await {
                            warn!("Failed to remove sender of {}: {}", self.path, e);
                        }
                    }
                }
                raw.stop();
            }
        }
        self.transceiver = None;
        self.stream_id = None;
        self.opened = false;
        self.paused_reasons.clear();
    }
}

impl fmt::Debug for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Track")
            .field("path", &self.path)
            .field("direction", &self.direction)
            .field("mid", &self.mid())
            .field("ssrc", &self.ssrc)
            .field("opened", &self.opened)
            .field("paused_reasons", &self.paused_reasons)
            .finish()
    }
}
