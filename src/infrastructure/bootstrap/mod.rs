//! Bootstrap endpoint client
//!
//! The first offer of a session is exchanged over HTTP: the client POSTs its
//! offer and receives the remote offer plus the initial mid → path map.

use crate::domain::shared::{Result, SessionError};
use crate::infrastructure::protocols::rpc::RtpMetadata;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootstrapRequest {
    pub sdp: String,
    pub cname: String,
    /// Offer listing every codec this client supports
    pub capability: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtp: Option<RtpMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BootstrapResponse {
    pub sdp: Option<String>,
    #[serde(default)]
    pub mid_media_path_map: HashMap<String, String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Bootstrap: Send + Sync {
    async fn exchange(&self, request: BootstrapRequest) -> Result<BootstrapResponse>;
}

/// POSTs the request as JSON to a fixed URL
pub struct HttpBootstrap {
    client: reqwest::Client,
    url: String,
}

impl HttpBootstrap {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Bootstrap for HttpBootstrap {
    async fn exchange(&self, request: BootstrapRequest) -> Result<BootstrapResponse> {
        debug!("Bootstrap request to {} for {}", self.url, request.cname);
        let response = self.client.post(&self.url).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!("Bootstrap rejected with status {}", status);
            return Err(SessionError::Transport(format!(
                "Request rejected with status {}",
                status.as_u16()
            )));
        }
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            SessionError::Protocol(format!("invalid bootstrap response: {}: {}", e, text))
        })
    }
}
