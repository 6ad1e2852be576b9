//! pathcast - client session controller for path-addressed WebRTC media
//!
//! Publishes local media under a path, watches media other clients publish,
//! and keeps the offer/answer state of one WebRTC connection consistent while
//! those requests race each other.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::Session;
pub use config::ClientConfig;
pub use domain::shared::error::SessionError;
pub use domain::shared::result::Result;
