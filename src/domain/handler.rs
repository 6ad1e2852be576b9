//! Application handler records
//!
//! Applications hand a capability record per media or stream to the session
//! instead of attaching closures to individual objects. Records are validated
//! when the media or stream is opened.

use crate::domain::shared::{Direction, PauseReason, Result, SessionError};
use crate::domain::track::TrackInfo;
use crate::domain::transport::StreamMessage;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Returns `false` to reject the track; the session then closes the media
pub type TrackOpenFn = Arc<dyn Fn(&TrackInfo) -> bool + Send + Sync>;
pub type TrackFn = Arc<dyn Fn(&TrackInfo) + Send + Sync>;
/// Returns a reconnect suggestion, only consulted for `remote_close`
pub type TrackPauseFn = Arc<dyn Fn(&TrackInfo, PauseReason) -> ReconnectHint + Send + Sync>;
pub type TrackResumeFn = Arc<dyn Fn(&TrackInfo, PauseReason) + Send + Sync>;

/// Reconnect interval suggested by a pause callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectHint {
    /// Use the configured track reconnect wait
    #[default]
    Default,
    /// Retry every given number of milliseconds; zero means default
    After(u64),
    /// Do not reconnect this track
    Never,
}

/// Callbacks for the tracks of one media
#[derive(Clone, Default)]
pub struct MediaHandler {
    pub(crate) on_open: Option<TrackOpenFn>,
    pub(crate) on_close: Option<TrackFn>,
    pub(crate) on_pause: Option<TrackPauseFn>,
    pub(crate) on_resume: Option<TrackResumeFn>,
    pub(crate) on_update: Option<TrackFn>,
}

impl MediaHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler that accepts every track and ignores every event
    pub fn noop() -> Self {
        Self::new().on_open(|_| true).on_close(|_| {})
    }

    pub fn on_open(mut self, f: impl Fn(&TrackInfo) -> bool + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(f));
        self
    }

    pub fn on_close(mut self, f: impl Fn(&TrackInfo) + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(f));
        self
    }

    pub fn on_pause(
        mut self,
        f: impl Fn(&TrackInfo, PauseReason) -> ReconnectHint + Send + Sync + 'static,
    ) -> Self {
        self.on_pause = Some(Arc::new(f));
        self
    }

    pub fn on_resume(
        mut self,
        f: impl Fn(&TrackInfo, PauseReason) + Send + Sync + 'static,
    ) -> Self {
        self.on_resume = Some(Arc::new(f));
        self
    }

    pub fn on_update(mut self, f: impl Fn(&TrackInfo) + Send + Sync + 'static) -> Self {
        self.on_update = Some(Arc::new(f));
        self
    }

    /// `on_open` and `on_close` are mandatory; `on_update` only makes sense for send media
    pub fn validate(&self, direction: Direction) -> Result<()> {
        if self.on_open.is_none() {
            return Err(SessionError::Configuration(
                "media handler requires on_open".to_string(),
            ));
        }
        if self.on_close.is_none() {
            return Err(SessionError::Configuration(
                "media handler requires on_close".to_string(),
            ));
        }
        if direction == Direction::Recv && self.on_update.is_some() {
            return Err(SessionError::Configuration(
                "on_update is only available for published media".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for MediaHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaHandler")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_pause", &self.on_pause.is_some())
            .field("on_resume", &self.on_resume.is_some())
            .field("on_update", &self.on_update.is_some())
            .finish()
    }
}

/// Returns `false` to close the stream right after it opened
pub type StreamOpenFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;
pub type StreamMessageFn = Arc<dyn Fn(&str, &StreamMessage) + Send + Sync>;
pub type StreamCloseFn = Arc<dyn Fn(&str) + Send + Sync>;
pub type StreamErrorFn = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Callbacks for one data stream
#[derive(Clone, Default)]
pub struct StreamHandler {
    pub(crate) on_open: Option<StreamOpenFn>,
    pub(crate) on_message: Option<StreamMessageFn>,
    pub(crate) on_close: Option<StreamCloseFn>,
    pub(crate) on_error: Option<StreamErrorFn>,
    /// Announce the stream to the remote peer (`publish_stream`) once open
    pub publish: bool,
    pub ordered: Option<bool>,
    pub max_retransmits: Option<u16>,
}

impl StreamHandler {
    pub fn new(on_message: impl Fn(&str, &StreamMessage) + Send + Sync + 'static) -> Self {
        Self {
            on_message: Some(Arc::new(on_message)),
            ..Self::default()
        }
    }

    pub fn on_open(mut self, f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(f));
        self
    }

    pub fn on_close(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn publish(mut self, publish: bool) -> Self {
        self.publish = publish;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.on_message.is_none() {
            return Err(SessionError::Configuration(
                "stream handler requires on_message".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for StreamHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandler")
            .field("publish", &self.publish)
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

pub type SessionOpenFn = Arc<dyn Fn() -> Option<Value> + Send + Sync>;
/// Returns the reconnect wait in nanoseconds; `None` or a non-positive value disables reconnect
pub type SessionCloseFn = Arc<dyn Fn() -> Option<i64> + Send + Sync>;
/// Decides how to handle a data stream opened by the remote peer
pub type SessionStreamFn = Arc<dyn Fn(&str) -> Option<StreamHandler> + Send + Sync>;

/// Session level callbacks
#[derive(Clone, Default)]
pub struct SessionHandler {
    pub(crate) on_open: Option<SessionOpenFn>,
    pub(crate) on_close: Option<SessionCloseFn>,
    pub(crate) on_stream: Option<SessionStreamFn>,
}

impl SessionHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_open(mut self, f: impl Fn() -> Option<Value> + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(f));
        self
    }

    pub fn on_close(mut self, f: impl Fn() -> Option<i64> + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(f));
        self
    }

    pub fn on_stream(
        mut self,
        f: impl Fn(&str) -> Option<StreamHandler> + Send + Sync + 'static,
    ) -> Self {
        self.on_stream = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for SessionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandler")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_stream", &self.on_stream.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_handler_requires_open_and_close() {
        let missing_close = MediaHandler::new().on_open(|_| true);
        assert!(matches!(
            missing_close.validate(Direction::Send),
            Err(SessionError::Configuration(_))
        ));
        let missing_open = MediaHandler::new().on_close(|_| {});
        assert!(missing_open.validate(Direction::Recv).is_err());
        assert!(MediaHandler::noop().validate(Direction::Recv).is_ok());
    }

    #[test]
    fn test_update_rejected_for_receivers() {
        let handler = MediaHandler::noop().on_update(|_| {});
        assert!(handler.validate(Direction::Send).is_ok());
        assert!(handler.validate(Direction::Recv).is_err());
    }

    #[test]
    fn test_stream_handler_requires_on_message() {
        assert!(StreamHandler::default().validate().is_err());
        let handler = StreamHandler::new(|_, _| {}).publish(true);
        assert!(handler.validate().is_ok());
        assert!(handler.publish);
    }

    #[test]
    fn test_reconnect_hint_defaults() {
        assert_eq!(ReconnectHint::default(), ReconnectHint::Default);
        let handler = MediaHandler::noop().on_pause(|_, _| ReconnectHint::Never);
        assert!(handler.on_pause.is_some());
        assert!(format!("{:?}", handler).contains("on_pause: true"));
    }
}
