//! dmsgpty host configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use super::{KeysConfig, DEFAULT_DISCOVERY_URL};

/// Network of the local CLI listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CliNet {
    Unix,
    Tcp,
}

impl fmt::Display for CliNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliNet::Unix => write!(f, "unix"),
            CliNet::Tcp => write!(f, "tcp"),
        }
    }
}

impl std::str::FromStr for CliNet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unix" => Ok(CliNet::Unix),
            "tcp" => Ok(CliNet::Tcp),
            other => Err(format!("unsupported cli network: {}", other)),
        }
    }
}

/// Configuration for a dmsgpty host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PtyHostConfig {
    /// Identity of the host on the dmsg network
    pub keys: KeysConfig,

    /// Discovery service base URL
    pub discovery_url: String,

    /// Relay sessions kept open by the host's client
    pub min_sessions: usize,

    /// dmsg port the host listens on for remote pty requests
    pub port: u16,

    /// File holding the whitelist of authorized keys
    pub whitelist_path: PathBuf,

    /// Network of the local CLI listener
    pub cli_net: CliNet,

    /// Address of the local CLI listener (socket path or host:port)
    pub cli_addr: String,
}

/// Default CLI socket path
pub fn default_cli_addr() -> String {
    std::env::temp_dir()
        .join("dmsgpty.sock")
        .to_string_lossy()
        .into_owned()
}

/// Default whitelist file
pub fn default_whitelist_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".dmsgpty")
        .join("whitelist.json")
}

impl Default for PtyHostConfig {
    fn default() -> Self {
        Self {
            keys: KeysConfig::generate(),
            discovery_url: DEFAULT_DISCOVERY_URL.to_string(),
            min_sessions: 1,
            port: 22,
            whitelist_path: default_whitelist_path(),
            cli_net: if cfg!(unix) { CliNet::Unix } else { CliNet::Tcp },
            cli_addr: if cfg!(unix) {
                default_cli_addr()
            } else {
                "127.0.0.1:3435".to_string()
            },
        }
    }
}
