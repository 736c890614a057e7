//! Configuration management for dmsg

mod client;
mod pty;
pub mod serde_utils;
mod server;

pub use client::{BackoffConfig, ClientConfig};
pub use pty::{default_cli_addr, default_whitelist_path, CliNet, PtyHostConfig};
pub use server::ServerConfig;

use dmsg_protocol::cipher::{generate_keypair, PubKey, SecKey};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Default discovery service
pub const DEFAULT_DISCOVERY_URL: &str = "http://dmsgd.skywire.skycoin.com";

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dmsg")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Key pair of an entity, hex encoded on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysConfig {
    pub public_key: PubKey,
    pub secret_key: SecKey,
}

impl KeysConfig {
    pub fn generate() -> Self {
        let (public_key, secret_key) = generate_keypair();
        Self {
            public_key,
            secret_key,
        }
    }

    /// Check that the public key belongs to the secret key
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret_key.pub_key() != self.public_key {
            return Err(ConfigError::Invalid(
                "public_key does not match secret_key".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self::generate()
    }
}

/// On-disk layout of the `dmsg` binary's config file
///
/// Each section is optional; missing sections take their defaults. The
/// top-level `keys` identify the relay server, `pty.keys` the pty host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub keys: KeysConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub pty: PtyHostConfig,
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_save_and_load_client_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("client.toml");

        let config = ClientConfig {
            min_sessions: 3,
            dial_timeout: Duration::from_secs(5),
            ..ClientConfig::default()
        };
        save_config(&path, &config).unwrap();

        let loaded: ClientConfig = load_config(&path).unwrap();
        assert_eq!(loaded.min_sessions, 3);
        assert_eq!(loaded.dial_timeout, Duration::from_secs(5));
        assert_eq!(loaded.accept_queue_size, config.accept_queue_size);
    }

    #[test]
    fn test_load_missing_config() {
        let dir = tempfile::tempdir().unwrap();
        let result: Result<ServerConfig, _> = load_config(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ServerConfig = toml::from_str("max_sessions = 5").unwrap();
        assert_eq!(config.max_sessions, 5);
        assert_eq!(config.bind_address, ServerConfig::default().bind_address);
    }

    #[test]
    fn test_config_file_sections() {
        let keys = KeysConfig::generate();
        let text = format!(
            "[keys]\npublic_key = \"{}\"\nsecret_key = \"{}\"\n\n[server]\nmax_sessions = 7\n\n[pty]\nport = 2222\ncli_net = \"tcp\"\n",
            keys.public_key,
            keys.secret_key.to_hex()
        );
        let file: ConfigFile = toml::from_str(&text).unwrap();
        assert_eq!(file.keys.public_key, keys.public_key);
        assert_eq!(file.server.max_sessions, 7);
        assert_eq!(file.pty.port, 2222);
        assert_eq!(file.pty.cli_net, CliNet::Tcp);
        assert_eq!(file.client.min_sessions, 1);
    }

    #[test]
    fn test_keys_config_validation() {
        let keys = KeysConfig::generate();
        assert!(keys.validate().is_ok());

        let text = toml::to_string(&keys).unwrap();
        let parsed: KeysConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.public_key, keys.public_key);

        let mismatched = KeysConfig {
            public_key: KeysConfig::generate().public_key,
            secret_key: keys.secret_key,
        };
        assert!(mismatched.validate().is_err());
    }
}
