//! Media aggregate
//!
//! Groups the tracks sharing one media path and carries the liveness and
//! reconnect bookkeeping of receive media.

use crate::domain::handler::ReconnectHint;
use crate::domain::path::{MediaPath, TrackPath};
use crate::domain::shared::{Direction, PauseReason, Result, SessionError};
use crate::domain::track::Track;
use crate::domain::transport::PeerConnection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInitOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause: Option<bool>,
}

/// Options sent with `produce`/`consume`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaInitOptions {
    /// Re-attach to tracks that already exist on this client
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<TrackInitOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<TrackInitOptions>,
}

impl MediaInitOptions {
    pub fn is_sync(&self) -> bool {
        self.sync.unwrap_or(false)
    }

    pub fn with_sync(mut self) -> Self {
        self.sync = Some(true);
        self
    }
}

#[derive(Debug)]
pub struct Media {
    path: MediaPath,
    direction: Direction,
    init_options: MediaInitOptions,
    tracks: BTreeMap<TrackPath, Track>,
    last_ping: Instant,
    reconnect_interval: Option<Duration>,
    next_reconnect: Option<Instant>,
    opened: bool,
}

impl Media {
    pub fn new(path: MediaPath, direction: Direction, init_options: MediaInitOptions) -> Self {
        Self {
            path,
            direction,
            init_options,
            tracks: BTreeMap::new(),
            last_ping: Instant::now(),
            reconnect_interval: None,
            next_reconnect: None,
            opened: true,
        }
    }

    pub fn path(&self) -> &MediaPath {
        &self.path
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_receiver(&self) -> bool {
        self.direction == Direction::Recv
    }

    pub fn init_options(&self) -> &MediaInitOptions {
        &self.init_options
    }

    pub fn is_opened(&self) -> bool {
        self.opened
    }

    pub fn set_opened(&mut self, opened: bool) {
        self.opened = opened;
    }

    pub fn add_track(&mut self, track: Track) -> Result<()> {
        if self.tracks.contains_key(track.path()) {
            return Err(SessionError::Resource(format!(
                "track already exists: {}",
                track.path()
            )));
        }
        self.tracks.insert(track.path().clone(), track);
        Ok(())
    }

    pub fn track(&self, path: &str) -> Option<&Track> {
        self.tracks.get(path)
    }

    pub fn track_mut(&mut self, path: &str) -> Option<&mut Track> {
        self.tracks.get_mut(path)
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn tracks_mut(&mut self) -> impl Iterator<Item = &mut Track> {
        self.tracks.values_mut()
    }

    pub fn track_paths(&self) -> Vec<TrackPath> {
        self.tracks.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Close one track and drop it from this media
    pub async fn close_track(
        &mut self,
        path: &str,
        pc: Option<&dyn PeerConnection>,
        force: bool,
    ) -> Option<Track> {
        let mut track = self.tracks.remove(path)?;
        track.close(pc, force).await;
        Some(track)
    }

    pub fn keep_alive(&mut self) {
        self.last_ping = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_ping)
    }

    /// Pause every track.
    ///
    /// For `remote_close` the tracks' reconnect suggestions are collected and
    /// the smallest one is returned. Tracks answering [`ReconnectHint::Never`]
    /// are left out; `None` means no track wants a reconnect.
    pub fn pause(&mut self, reason: PauseReason, default_wait: Duration) -> Option<Duration> {
        let mut waits = Vec::new();
        for track in self.tracks.values_mut() {
            let hint = track.pause(reason, false);
            if reason != PauseReason::RemoteClose {
                continue;
            }
            match hint {
                ReconnectHint::Default | ReconnectHint::After(0) => waits.push(default_wait),
                ReconnectHint::After(ms) => waits.push(Duration::from_millis(ms)),
                ReconnectHint::Never => {}
            }
        }
        waits.into_iter().min()
    }

    pub fn resume(&mut self, reason: PauseReason) {
        for track in self.tracks.values_mut() {
            track.resume(reason, false);
        }
    }

    /// Arm a fixed-interval reconnect schedule starting at `now`
    pub fn start_reconnect(&mut self, interval: Duration, now: Instant) {
        self.reconnect_interval = Some(interval);
        self.next_reconnect = Some(now + interval);
    }

    pub fn stop_reconnect(&mut self) {
        self.reconnect_interval = None;
        self.next_reconnect = None;
    }

    pub fn reconnect_interval(&self) -> Option<Duration> {
        self.reconnect_interval
    }

    pub fn reconnect_due(&self, now: Instant) -> bool {
        matches!(self.next_reconnect, Some(at) if now > at)
    }

    pub fn schedule_next_reconnect(&mut self, now: Instant) {
        if let Some(interval) = self.reconnect_interval {
            self.next_reconnect = Some(now + interval);
        }
    }

    /// Options for the `watch_media` call re-issued by a reconnect
    pub fn reconnect_options(&self) -> MediaInitOptions {
        self.init_options.clone().with_sync()
    }
}
