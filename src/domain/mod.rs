//! Domain layer - session model and rules
//!
//! This layer contains:
//! - Value objects: paths, kinds, pause reasons, identity
//! - Entities: tracks and the medias grouping them
//! - Handler records: application callbacks validated at registration
//! - Transport port: the media engine capability set the session drives

pub mod handler;
pub mod media;
pub mod path;
pub mod shared;
pub mod track;
pub mod transport;

// Re-export commonly used types
pub use shared::{Result, SessionError};
