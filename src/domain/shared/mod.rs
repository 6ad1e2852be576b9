//! Shared kernel - types used by tracks, medias and the session

pub mod error;
pub mod result;
pub mod value_objects;

pub use error::SessionError;
pub use result::Result;
pub use value_objects::*;
