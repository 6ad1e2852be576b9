//! Input liveness of receive media
//!
//! The remote peer pings every receive media it keeps sending. A media with
//! no ping for longer than the threshold is paused with `remote_close` once,
//! then resubscribed on a fixed interval until pings come back.

use crate::config::ClientConfig;
use crate::domain::media::{Media, MediaInitOptions};
use crate::domain::path::MediaPath;
use crate::domain::shared::PauseReason;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Outcome of one liveness tick
#[derive(Debug, Default)]
pub struct LivenessReport {
    /// Medias to resubscribe, with the options to resubscribe with
    pub reconnects: Vec<(MediaPath, MediaInitOptions)>,
    /// Some send media is open; the remote peer expects our ping
    pub ping: bool,
}

#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    threshold: Duration,
    reconnect_wait: Duration,
}

impl LivenessMonitor {
    pub fn new(threshold: Duration, reconnect_wait: Duration) -> Self {
        Self {
            threshold,
            reconnect_wait,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.no_input_threshold(), config.track_reconnect_wait())
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub fn check<'a>(
        &self,
        medias: impl IntoIterator<Item = &'a mut Media>,
        now: Instant,
    ) -> LivenessReport {
        let mut report = LivenessReport::default();
        for media in medias {
            if !media.is_receiver() {
                if media.is_opened() && media.tracks().any(|t| t.is_opened()) {
                    report.ping = true;
                }
                continue;
            }

            if media.idle_for(now) > self.threshold {
                if media.is_opened() {
                    warn!("No input for {} in {:?}", media.path(), self.threshold);
                    media.set_opened(false);
                    if let Some(interval) = media.pause(PauseReason::RemoteClose, self.reconnect_wait)
                    {
                        media.start_reconnect(interval, now);
                        report
                            .reconnects
                            .push((media.path().clone(), media.reconnect_options()));
                    }
                } else if media.reconnect_due(now) {
                    media.schedule_next_reconnect(now);
                    report
                        .reconnects
                        .push((media.path().clone(), media.reconnect_options()));
                }
            } else if !media.is_opened() {
                info!("Input for {} resumed", media.path());
                media.set_opened(true);
                media.stop_reconnect();
                media.resume(PauseReason::RemoteClose);
            }
        }
        report
    }
}
