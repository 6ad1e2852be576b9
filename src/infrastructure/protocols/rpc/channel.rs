/// Control channel RPC
///
/// Correlates calls made over the `$syscall` data channel with their
/// responses. A call registers a pending entry before its frame is sent, so a
/// response can never arrive for an unknown msgid because of ordering.
use super::message::{Syscall, SyscallMessage};
use crate::domain::shared::{Result, SessionError};
use crate::domain::transport::DataChannel;
use crate::infrastructure::telemetry;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, trace};

pub type RpcResult = Result<Value>;

struct ChannelState {
    channel: Option<Arc<dyn DataChannel>>,
    pending: HashMap<u64, oneshot::Sender<RpcResult>>,
    seed: u64,
}

pub struct ControlChannel {
    state: Mutex<ChannelState>,
    max_msgid: u64,
}

impl ControlChannel {
    pub fn new(max_msgid: u64) -> Self {
        Self {
            state: Mutex::new(ChannelState {
                channel: None,
                pending: HashMap::new(),
                seed: 1,
            }),
            max_msgid: max_msgid.max(2),
        }
    }

    /// Route calls through `channel`
    pub async fn attach(&self, channel: Arc<dyn DataChannel>) {
        self.state.lock().await.channel = Some(channel);
    }

    /// Drop the channel and fail every call still waiting for a response
    pub async fn detach(&self) {
        let pending: Vec<_> = {
            let mut state = self.state.lock().await;
            state.channel = None;
            state.seed = 1;
            state.pending.drain().collect()
        };
        for (msgid, tx) in pending {
            debug!("Rejecting pending call msgid={}", msgid);
            let _ = tx.send(Err(SessionError::Transport(
                "control channel closed".to_string(),
            )));
        }
    }

    pub async fn is_attached(&self) -> bool {
        self.state.lock().await.channel.is_some()
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Call `function` on the remote peer and wait for its response
    pub async fn call(&self, function: &str, args: impl Serialize) -> RpcResult {
        let args = serde_json::to_value(args)?;
        let (msgid, channel, rx) = {
            let mut state = self.state.lock().await;
            let channel = state.channel.clone().ok_or_else(|| {
                SessionError::Transport("control channel is not open".to_string())
            })?;
            let msgid = Self::next_msgid(&mut state, self.max_msgid);
            let (tx, rx) = oneshot::channel();
            state.pending.insert(msgid, tx);
            (msgid, channel, rx)
        };

        let frame = SyscallMessage::request(function, args, msgid).to_json()?;
        if Syscall::is_verbose(function) {
            trace!("syscall -> {}", frame);
        } else {
            debug!("syscall -> {}", frame);
        }
        if let Err(e) = channel.send_text(frame).await {
            self.state.lock().await.pending.remove(&msgid);
            telemetry::record_rpc(function, "send_failed");
            return Err(e);
        }

        let result = rx.await.unwrap_or_else(|_| {
            Err(SessionError::Transport(
                "control channel closed".to_string(),
            ))
        });
        telemetry::record_rpc(function, if result.is_ok() { "ok" } else { "error" });
        result
    }

    /// Remove and return the waiter for `msgid`
    pub async fn take_pending(&self, msgid: u64) -> Option<oneshot::Sender<RpcResult>> {
        self.state.lock().await.pending.remove(&msgid)
    }

    /// Next msgid, wrapping to 1 at the maximum and skipping ids still in flight
    fn next_msgid(state: &mut ChannelState, max_msgid: u64) -> u64 {
        loop {
            if state.seed >= max_msgid {
                state.seed = 1;
            }
            let msgid = state.seed;
            state.seed += 1;
            if !state.pending.contains_key(&msgid) {
                return msgid;
            }
        }
    }
}
