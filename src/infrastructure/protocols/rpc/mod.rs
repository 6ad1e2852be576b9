//! Control channel protocol
pub mod channel;
pub mod message;

pub use channel::{ControlChannel, RpcResult};
pub use message::{
    CloseMediaAck, ConsumeArgs, NegotiationAck, PathArgs, ProduceArgs, RemoteAnswerArgs,
    RtpMetadata, Syscall, SyscallMessage, TrackStatus, SYSCALL_STREAM,
};
