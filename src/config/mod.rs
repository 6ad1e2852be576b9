//! Configuration management

use crate::domain::shared::{Result, SessionError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest integer a JSON number carries without loss
pub const MAX_SAFE_MSGID: u64 = (1 << 53) - 1;

/// What to do with a notification whose `fn` is not known
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownSyscallPolicy {
    /// Fail the frame with a protocol error
    #[default]
    Abort,
    /// Log and continue
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Bootstrap (signaling) endpoint receiving the first offer
    pub bootstrap_url: String,
    /// Client name; generated when absent
    pub cname: Option<String>,
    /// Session reconnect wait used when no close callback is installed
    pub reconnect_wait_ms: u64,
    /// Track reconnect wait used when a pause callback gives no interval
    pub track_reconnect_wait_ms: u64,
    pub liveness_tick_ms: u64,
    /// Ticks without a ping before a receive media counts as silent
    pub no_input_threshold_ticks: u32,
    /// Delay before applying the latest of several queued remote offers
    pub negotiation_settle_ms: u64,
    pub default_scalability_mode: String,
    pub max_encodings: usize,
    pub max_msgid: u64,
    pub unknown_syscall: UnknownSyscallPolicy,
    pub ice_servers: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bootstrap_url: "http://localhost:8888/qrpc".to_string(),
            cname: None,
            reconnect_wait_ms: 5000,
            track_reconnect_wait_ms: 5000,
            liveness_tick_ms: 1000,
            no_input_threshold_ticks: 3,
            negotiation_settle_ms: 1000,
            default_scalability_mode: "L1T3".to_string(),
            max_encodings: 3,
            max_msgid: MAX_SAFE_MSGID,
            unknown_syscall: UnknownSyscallPolicy::Abort,
            ice_servers: Vec::new(),
        }
    }
}

impl ClientConfig {
    pub fn new(bootstrap_url: impl Into<String>) -> Self {
        Self {
            bootstrap_url: bootstrap_url.into(),
            ..Self::default()
        }
    }

    /// Load from an optional file, then apply `PATHCAST_*` environment overrides
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder
            .add_source(
                config::Environment::with_prefix("PATHCAST")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("ice_servers"),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| SessionError::Configuration(e.to_string()))
    }

    /// Parse a TOML document
    pub fn from_toml(document: &str) -> Result<Self> {
        config::Config::builder()
            .add_source(config::File::from_str(document, config::FileFormat::Toml))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| SessionError::Configuration(e.to_string()))
    }

    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_millis(self.reconnect_wait_ms)
    }

    pub fn track_reconnect_wait(&self) -> Duration {
        Duration::from_millis(self.track_reconnect_wait_ms)
    }

    pub fn liveness_tick(&self) -> Duration {
        Duration::from_millis(self.liveness_tick_ms)
    }

    pub fn no_input_threshold(&self) -> Duration {
        self.liveness_tick() * self.no_input_threshold_ticks
    }

    pub fn negotiation_settle(&self) -> Duration {
        Duration::from_millis(self.negotiation_settle_ms)
    }
}
