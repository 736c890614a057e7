//! Relay server configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;
use super::DEFAULT_DISCOVERY_URL;

/// Configuration for a dmsg relay server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the TCP listener to
    pub bind_address: String,

    /// Address advertised in discovery (defaults to the bound address)
    pub public_address: Option<String>,

    /// Maximum number of concurrent client sessions
    pub max_sessions: usize,

    /// How often the server entry is refreshed in discovery
    #[serde(with = "duration_secs")]
    pub update_interval: Duration,

    /// Bound on the session handshake after accept
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,

    /// Discovery service base URL
    pub discovery_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8081".to_string(),
            public_address: None,
            max_sessions: 2048,
            update_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            discovery_url: DEFAULT_DISCOVERY_URL.to_string(),
        }
    }
}
