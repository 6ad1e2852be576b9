//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - Protocol implementations (control channel RPC, WebRTC engine adapter)
//! - The bootstrap HTTP client
//! - Metrics helpers

pub mod bootstrap;
pub mod protocols;
pub mod telemetry;
