//! Session errors

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SessionError {
    /// Malformed or unrecognized control message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Remote offer/answer missing an expected field, or no transceiver for a track
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Bootstrap request rejected, or control channel unavailable
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation references a path with no Track/Media/handler
    #[error("Resource not found: {0}")]
    Resource(String),

    /// Invalid encodings, malformed path or handler registration
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The remote peer answered a syscall with `args.error`
    #[error("Remote error in {function}: {message}")]
    Rpc { function: String, message: String },

    /// Failure reported by the media transport engine
    #[error("Engine error: {0}")]
    Engine(String),

    #[error("JSON error: {0}")]
    Json(String),
}

impl SessionError {
    /// Short tag used as a metrics label
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Protocol(_) => "protocol",
            SessionError::Negotiation(_) => "negotiation",
            SessionError::Transport(_) => "transport",
            SessionError::Resource(_) => "resource",
            SessionError::Configuration(_) => "configuration",
            SessionError::InvalidState(_) => "invalid_state",
            SessionError::Rpc { .. } => "rpc",
            SessionError::Engine(_) => "engine",
            SessionError::Json(_) => "json",
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::Json(e.to_string())
    }
}

impl From<webrtc::Error> for SessionError {
    fn from(e: webrtc::Error) -> Self {
        SessionError::Engine(e.to_string())
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(e: reqwest::Error) -> Self {
        SessionError::Transport(e.to_string())
    }
}
