//! Client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use super::DEFAULT_DISCOVERY_URL;

/// Configuration for a dmsg client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Discovery service base URL
    pub discovery_url: String,

    /// Number of relay sessions kept open for redundancy
    pub min_sessions: usize,

    /// How long a dial waits for the remote ACCEPT
    #[serde(with = "duration_secs")]
    pub dial_timeout: Duration,

    /// Bound on the session handshake after TCP connect
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,

    /// How long a closed stream waits for the peer's CLOSE
    #[serde(with = "duration_millis")]
    pub close_timeout: Duration,

    /// Capacity of each listener's accept queue
    pub accept_queue_size: usize,

    /// How often the client entry is refreshed in discovery
    #[serde(with = "duration_secs")]
    pub update_interval: Duration,

    /// Backoff between failed session dials
    pub backoff: BackoffConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            discovery_url: DEFAULT_DISCOVERY_URL.to_string(),
            min_sessions: 1,
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
            accept_queue_size: 64,
            update_interval: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_millis")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_millis")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}
