//! Config command implementations

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::output::{format_settings, print_info, print_success, print_warning};
use dmsg_core::config::{self, ConfigFile};

fn config_path(path: Option<&PathBuf>) -> PathBuf {
    path.cloned().unwrap_or_else(config::default_config_path)
}

/// Load the config file, falling back to defaults when none exists
///
/// An explicitly given path must exist.
pub fn load_config_file(path: Option<&PathBuf>) -> Result<ConfigFile> {
    if let Some(path) = path {
        return config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path));
    }

    let default_path = config::default_config_path();
    if default_path.exists() {
        config::load_config(&default_path)
            .with_context(|| format!("Failed to load config from {:?}", default_path))
    } else {
        tracing::info!("Using default configuration");
        Ok(ConfigFile::default())
    }
}

/// Write a default config with freshly generated keys
pub fn config_init(path: Option<&PathBuf>, force: bool) -> Result<PathBuf> {
    let path = config_path(path);

    if path.exists() && !force {
        print_warning(&format!("Config file already exists: {:?}", path));
        print_info("Use --force to overwrite");
        return Ok(path);
    }

    config::save_config(&path, &ConfigFile::default())
        .with_context(|| format!("Failed to write config to {:?}", path))?;
    print_success(&format!("Wrote configuration to {:?}", path));
    Ok(path)
}

/// Print the effective configuration
pub fn config_show(path: Option<&PathBuf>, raw: bool) -> Result<()> {
    let file = load_config_file(path)?;

    if raw {
        print!("{}", toml::to_string_pretty(&file)?);
        return Ok(());
    }

    println!("{}", format_settings(&settings(&file, &config_path(path))));
    Ok(())
}

fn settings(file: &ConfigFile, path: &Path) -> Vec<(&'static str, String)> {
    vec![
        ("file", path.display().to_string()),
        ("server.public_key", file.keys.public_key.to_hex()),
        ("server.bind_address", file.server.bind_address.clone()),
        (
            "server.public_address",
            file.server
                .public_address
                .clone()
                .unwrap_or_else(|| "-".to_string()),
        ),
        ("server.max_sessions", file.server.max_sessions.to_string()),
        ("server.discovery_url", file.server.discovery_url.clone()),
        ("client.min_sessions", file.client.min_sessions.to_string()),
        ("pty.public_key", file.pty.keys.public_key.to_hex()),
        ("pty.discovery_url", file.pty.discovery_url.clone()),
        ("pty.port", file.pty.port.to_string()),
        ("pty.whitelist_path", file.pty.whitelist_path.display().to_string()),
        ("pty.cli", format!("{}://{}", file.pty.cli_net, file.pty.cli_addr)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        config_init(Some(&path), false).unwrap();
        let first = load_config_file(Some(&path)).unwrap();
        assert!(first.keys.validate().is_ok());
        assert!(first.pty.keys.validate().is_ok());

        // Without --force the existing keys survive.
        config_init(Some(&path), false).unwrap();
        let second = load_config_file(Some(&path)).unwrap();
        assert_eq!(first.keys.public_key, second.keys.public_key);

        config_init(Some(&path), true).unwrap();
        let third = load_config_file(Some(&path)).unwrap();
        assert_ne!(first.keys.public_key, third.keys.public_key);
    }

    #[test]
    fn test_explicit_missing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(load_config_file(Some(&path)).is_err());
    }
}
