//! Key pair generation

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::output::print_success;
use dmsg_core::config::{self, KeysConfig};
use dmsg_protocol::cipher::generate_deterministic_keypair;

/// Generate a key pair, print it, and optionally save it as TOML
///
/// With a `seed` the pair is derived deterministically.
pub fn keygen_command(seed: Option<&str>, output: Option<&PathBuf>) -> Result<()> {
    let keys = match seed {
        Some(seed) => {
            let (public_key, secret_key) = generate_deterministic_keypair(seed.as_bytes());
            KeysConfig {
                public_key,
                secret_key,
            }
        }
        None => KeysConfig::generate(),
    };

    println!("public_key: {}", keys.public_key);
    println!("secret_key: {}", keys.secret_key.to_hex());

    if let Some(path) = output {
        config::save_config(path, &keys)
            .with_context(|| format!("Failed to write keys to {:?}", path))?;
        print_success(&format!("Saved keys to {:?}", path));
    }

    Ok(())
}
