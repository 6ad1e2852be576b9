//! Application layer - the client session
//!
//! This layer drives the domain model against the engine and the remote peer:
//! - Session lifecycle and the public media/stream API
//! - Ordered application of remote offers
//! - Inbound event and control frame dispatch
//! - Liveness of received media

pub mod dispatch;
pub mod liveness;
pub mod negotiation;
pub mod session;

pub use liveness::{LivenessMonitor, LivenessReport};
pub use negotiation::{Admission, NegotiationQueue, PendingOffer};
pub use session::Session;
