//! Negotiation queue
//!
//! Remote offers are applied to the connection one at a time, in generation
//! order. An offer arriving while another is being applied waits; once the
//! running application finishes and the burst settles, only the newest
//! waiting offer is applied and the older ones are dropped as superseded.

use super::session::Session;
use crate::domain::path::TrackPath;
use crate::domain::shared::{Result, SessionError};
use crate::domain::transport::SessionDescription;
use crate::infrastructure::protocols::rpc::RemoteAnswerArgs;
use crate::infrastructure::protocols::webrtc::{mid_ssrc_map, ssrc_fixups, MidSsrcMap};
use crate::infrastructure::telemetry;
use std::collections::BTreeMap;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A remote offer waiting to be applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOffer {
    pub sdp: String,
    pub generation: u64,
    /// Send tracks to commit once the offer fixed the mids
    pub snapshot: Vec<TrackPath>,
}

/// Highest generation whose fate is decided, and highest applied one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub settled: u64,
    pub applied: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Queue was idle; the caller applies the offer
    Apply,
    /// An application is running; the offer waits its turn
    Queued,
    /// A newer generation is queued or applied already
    Stale,
}

pub struct NegotiationQueue {
    entries: Vec<PendingOffer>,
    progress: watch::Sender<Progress>,
}

impl Default for NegotiationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl NegotiationQueue {
    pub fn new() -> Self {
        let (progress, _) = watch::channel(Progress::default());
        Self {
            entries: Vec::new(),
            progress,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_applied(&self) -> u64 {
        self.progress.borrow().applied
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    pub fn admit(&mut self, entry: PendingOffer) -> Admission {
        if entry.generation < self.last_applied()
            || self.entries.iter().any(|e| e.generation > entry.generation)
        {
            return Admission::Stale;
        }
        self.entries.push(entry);
        if self.entries.len() > 1 {
            Admission::Queued
        } else {
            Admission::Apply
        }
    }

    /// Offers arrived while the head entry was being applied
    pub fn has_waiting(&self) -> bool {
        self.entries.len() > 1
    }

    pub fn mark_applied(&mut self, generation: u64) {
        self.progress.send_modify(|p| {
            p.applied = p.applied.max(generation);
            p.settled = p.settled.max(generation);
        });
    }

    /// Keep only the newest entry and return it for application
    pub fn collapse(&mut self) -> Option<PendingOffer> {
        let last = self.entries.pop()?;
        let superseded = self.entries.len().saturating_sub(1);
        for _ in 0..superseded {
            telemetry::record_stale_generation();
        }
        self.entries.clear();
        self.entries.push(last.clone());
        Some(last)
    }

    pub fn finish(&mut self) {
        self.entries.clear();
    }

    /// Drop every entry; their waiters are told the round failed
    pub fn fail(&mut self) {
        let highest = self.entries.iter().map(|e| e.generation).max().unwrap_or(0);
        self.entries.clear();
        self.progress.send_modify(|p| p.settled = p.settled.max(highest));
    }
}

/// Wait until the round `generation` was applied or superseded by an applied one
async fn wait_settled(mut progress: watch::Receiver<Progress>, generation: u64) -> Result<()> {
    let applied = progress
        .wait_for(|p| p.settled >= generation)
        .await
        .map_err(|_| SessionError::InvalidState("session closed during negotiation".to_string()))?
        .applied;
    if applied >= generation {
        Ok(())
    } else {
        Err(SessionError::Negotiation(format!(
            "negotiation round {} failed",
            generation
        )))
    }
}

impl Session {
    /// Queue a remote offer and return once it (or a newer offer) is applied
    pub(super) async fn set_remote_offer(
        &self,
        sdp: String,
        generation: u64,
        snapshot: Vec<TrackPath>,
    ) -> Result<()> {
        let mut entry = PendingOffer {
            sdp,
            generation,
            snapshot,
        };
        let (epoch, admission, progress) = {
            let mut state = self.inner.state.lock().await;
            let admission = state.queue.admit(entry.clone());
            (state.epoch, admission, state.queue.subscribe())
        };
        match admission {
            Admission::Stale => {
                debug!("Dropping stale remote offer of generation {}", generation);
                telemetry::record_stale_generation();
                return Ok(());
            }
            Admission::Queued => {
                debug!("Remote offer of generation {} queued", generation);
                return wait_settled(progress, generation).await;
            }
            Admission::Apply => {}
        }

        loop {
            let started = Instant::now();
            let applied = self.apply_remote_offer(&entry, epoch).await;

            let mut state = self.inner.state.lock().await;
            state.ensure_epoch(epoch)?;
            if let Err(e) = applied {
                warn!(
                    "Failed to apply remote offer of generation {}: {}",
                    entry.generation, e
                );
                state.queue.fail();
                return Err(e);
            }
            telemetry::record_negotiation_applied(started.elapsed());
            state.queue.mark_applied(entry.generation);
            if !state.queue.has_waiting() {
                state.queue.finish();
                return Ok(());
            }
            drop(state);

            tokio::time::sleep(self.inner.config.negotiation_settle()).await;

            let mut state = self.inner.state.lock().await;
            state.ensure_epoch(epoch)?;
            entry = match state.queue.collapse() {
                Some(next) => next,
                None => return Ok(()),
            };
            debug!(
                "Applying collapsed remote offer of generation {}",
                entry.generation
            );
        }
    }

    /// One offer/answer round against the live connection.
    ///
    /// The state lock is only held to read the round's inputs and to commit
    /// its results; engine calls run without it.
    async fn apply_remote_offer(&self, entry: &PendingOffer, epoch: u64) -> Result<()> {
        let (pc, mid_path_map, negotiated, bindings) = {
            let state = self.inner.state.lock().await;
            state.ensure_epoch(epoch)?;
            let pc = state
                .pc
                .clone()
                .ok_or_else(|| SessionError::InvalidState("not connected".to_string()))?;
            let mut bindings = Vec::with_capacity(entry.snapshot.len());
            for path in &entry.snapshot {
                let Some(track) = state.track(path.as_str()) else {
                    debug!("Track {} closed before commit", path);
                    continue;
                };
                bindings.push((track.send_binding()?, track.ssrc().map(str::to_string)));
            }
            (pc, state.mid_path_map.clone(), state.negotiated, bindings)
        };

        pc.set_remote_description(SessionDescription::offer(entry.sdp.clone()))
            .await?;
        let mut committed = Vec::with_capacity(bindings.len());
        let mut before = MidSsrcMap::new();
        for (binding, ssrc) in bindings {
            let transceiver = binding.commit_on(pc.as_ref(), &mid_path_map).await?;
            if let (Some(mid), Some(ssrc)) = (transceiver.mid(), ssrc) {
                before.insert(mid, ssrc);
            }
            committed.push((binding.path().clone(), transceiver));
        }

        let answer = pc.create_answer().await?;
        let mut fixups = BTreeMap::new();
        if negotiated && !before.is_empty() {
            fixups = ssrc_fixups(&before, &mid_ssrc_map(&answer.sdp)?);
            fixups.retain(|_, pair| pair[0] != pair[1]);
        }

        {
            let mut state = self.inner.state.lock().await;
            state.ensure_epoch(epoch)?;
            for (path, transceiver) in committed {
                let fixup = transceiver.mid().and_then(|mid| fixups.get(&mid).copied());
                let Some(track) = state.track_mut(path.as_str()) else {
                    debug!("Track {} closed during commit", path);
                    continue;
                };
                track.bind(transceiver);
                if let Some([_, new]) = fixup {
                    track.set_ssrc((new != 0).then(|| new.to_string()));
                }
            }
        }

        if !fixups.is_empty() {
            info!("Remapping ssrcs of {} section(s)", fixups.len());
            self.inner
                .rpc
                .call("remote_answer", RemoteAnswerArgs::new(fixups))
                .await?;
        }
        pc.set_local_description(answer).await
    }
}
