//! Host app ↔ provider messages
//!
//! Requests are small JSON objects:
//!
//! ```json
//! {"action": "start", "tunnelId": "t1", "config": {"host": "...", "port": 8388, ...}}
//! {"action": "restart", "config": {...}}
//! {"action": "stop"}
//! {"action": "getTunnelId"}
//! ```
//!
//! Every reply carries an integer `errorCode` and, when a tunnel is active,
//! its `tunnelId`.

use crate::config::ServerConfiguration;
use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};

/// Requested operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AppAction {
    Start,
    /// Apply a new configuration to the running tunnel
    Restart,
    Stop,
    GetTunnelId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppRequest {
    pub action: AppAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ServerConfiguration>,
}

impl AppRequest {
    pub fn new(action: AppAction) -> Self {
        Self {
            action,
            tunnel_id: None,
            config: None,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Configuration carried by the request, tagged with the request's tunnel id
    pub fn configuration(&self) -> Option<ServerConfiguration> {
        let mut config = self.config.clone()?;
        if config.id.is_none() {
            config.id = self.tunnel_id.clone();
        }
        Some(config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppResponse {
    pub error_code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<String>,
}

impl AppResponse {
    pub fn ok() -> Self {
        Self::from_code(ErrorCode::NoError)
    }

    pub fn from_code(error_code: ErrorCode) -> Self {
        Self {
            error_code,
            tunnel_id: None,
        }
    }

    pub fn from_result(result: Result<(), ErrorCode>) -> Self {
        Self::from_code(result.err().unwrap_or(ErrorCode::NoError))
    }

    pub fn with_tunnel_id(mut self, tunnel_id: Option<String>) -> Self {
        self.tunnel_id = tunnel_id;
        self
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}
