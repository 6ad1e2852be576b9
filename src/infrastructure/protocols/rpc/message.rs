/// Control channel frames
///
/// Every frame is a JSON text message `{fn, args?, msgid?}`. Frames without a
/// msgid (or with msgid 0) are notifications; the rest answer a call this
/// client made, carrying the call's msgid and the `<fn>_ack` name.
use crate::domain::media::MediaInitOptions;
use crate::domain::shared::{Result, SessionError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Label of the control data channel
pub const SYSCALL_STREAM: &str = "$syscall";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyscallMessage {
    #[serde(rename = "fn")]
    pub function: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msgid: Option<u64>,
}

impl SyscallMessage {
    pub fn request(function: impl Into<String>, args: Value, msgid: u64) -> Self {
        Self {
            function: function.into(),
            args: Some(args),
            msgid: Some(msgid),
        }
    }

    pub fn notification(function: impl Into<String>, args: Value) -> Self {
        Self {
            function: function.into(),
            args: Some(args),
            msgid: None,
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| SessionError::Protocol(format!("invalid frame {}: {}", text, e)))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn is_notification(&self) -> bool {
        self.msgid.unwrap_or(0) == 0
    }

    pub fn args(&self) -> &Value {
        self.args.as_ref().unwrap_or(&Value::Null)
    }

    /// `args.error` of a response, if the remote call failed
    pub fn error(&self) -> Option<String> {
        match self.args().get("error")? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// `args.path` of a notification
    pub fn path(&self) -> Option<&str> {
        self.args().get("path").and_then(Value::as_str)
    }

    /// Decode `args` into a typed payload
    pub fn decode_args<T: DeserializeOwned + Default>(&self) -> Result<T> {
        match &self.args {
            None | Some(Value::Null) => Ok(T::default()),
            Some(args) => serde_json::from_value(args.clone()).map_err(|e| {
                SessionError::Protocol(format!("invalid args for {}: {}", self.function, e))
            }),
        }
    }
}

/// Classification of an inbound frame by its `fn`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Close,
    CloseTrack,
    RemotePause,
    RemoteResume,
    Ping,
    Consume,
    ConsumeAck,
    Produce,
    ProduceAck,
    CloseMediaAck,
    /// Any other `<fn>_ack`
    Ack,
    Unknown,
}

impl Syscall {
    pub fn classify(function: &str) -> Self {
        match function {
            "close" => Syscall::Close,
            "close_track" => Syscall::CloseTrack,
            "remote_pause" => Syscall::RemotePause,
            "remote_resume" => Syscall::RemoteResume,
            "ping" => Syscall::Ping,
            "consume" => Syscall::Consume,
            "consume_ack" => Syscall::ConsumeAck,
            "produce" => Syscall::Produce,
            "produce_ack" => Syscall::ProduceAck,
            "close_media_ack" => Syscall::CloseMediaAck,
            f if f.ends_with("_ack") => Syscall::Ack,
            _ => Syscall::Unknown,
        }
    }

    /// Frames too frequent for the debug log
    pub fn is_verbose(function: &str) -> bool {
        matches!(function, "ping" | "ping_ack")
    }
}

/// `status_map` entry of a consume/produce ack
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackStatus {
    #[serde(default)]
    pub paused_reasons: Vec<String>,
}

/// `consume_ack` / `produce_ack` payload
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NegotiationAck {
    pub sdp: Option<String>,
    #[serde(default)]
    pub mid_media_path_map: HashMap<String, String>,
    #[serde(default)]
    pub status_map: HashMap<String, TrackStatus>,
}

/// `close_media_ack` payload
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CloseMediaAck {
    pub sdp: Option<String>,
    #[serde(default)]
    pub paths: Vec<String>,
}

/// Simulcast metadata sent along with a publish offer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpMetadata {
    pub rid_scalability_mode_map: BTreeMap<String, String>,
}

/// `produce` arguments
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceArgs {
    pub sdp: String,
    pub init_options: MediaInitOptions,
    pub mid_path_map: BTreeMap<String, String>,
    pub rtp: RtpMetadata,
}

/// `consume` arguments
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeArgs {
    pub path: String,
    pub init_options: MediaInitOptions,
}

/// Arguments naming one path (`pause`, `resume`, `close_media`, `publish_stream`)
#[derive(Debug, Clone, Serialize)]
pub struct PathArgs {
    pub path: String,
}

impl PathArgs {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SsrcFixups {
    pub ssrc_fixups: Vec<[u64; 2]>,
}

/// `remote_answer` arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAnswerArgs {
    pub mid_map: BTreeMap<String, SsrcFixups>,
}

impl RemoteAnswerArgs {
    pub fn new(fixups: BTreeMap<String, [u64; 2]>) -> Self {
        Self {
            mid_map: fixups
                .into_iter()
                .map(|(mid, pair)| (mid, SsrcFixups { ssrc_fixups: vec![pair] }))
                .collect(),
        }
    }
}
