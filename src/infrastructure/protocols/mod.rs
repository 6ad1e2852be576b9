//! Protocol implementations

pub mod rpc;
pub mod webrtc;
