//! Relay server and discovery service commands

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use super::{load_config_file, shutdown_signal};
use crate::output::print_success;
use dmsg::Server;
use dmsg_core::disc::{Discovery, HttpDiscovery};

/// Run a relay server until interrupted
pub async fn server_command(
    config_path: Option<&PathBuf>,
    bind: Option<String>,
    public_address: Option<String>,
    discovery_url: Option<String>,
) -> Result<()> {
    let file = load_config_file(config_path)?;
    file.keys.validate()?;

    let mut config = file.server;
    if let Some(bind) = bind {
        config.bind_address = bind;
    }
    if public_address.is_some() {
        config.public_address = public_address;
    }
    if let Some(url) = discovery_url {
        config.discovery_url = url;
    }

    let listener = TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;
    let local = listener.local_addr()?;

    let discovery: Arc<dyn Discovery> = Arc::new(HttpDiscovery::new(config.discovery_url.clone()));
    let server = Server::new(file.keys.public_key, file.keys.secret_key, discovery, config);

    print_success(&format!(
        "Relay server {} listening on {}",
        server.local_pk(),
        local
    ));

    tokio::select! {
        res = server.serve(listener) => res.context("Relay server failed")?,
        _ = shutdown_signal() => {
            tracing::info!(sessions = server.session_count(), "Shutting down relay server");
        }
    }
    server.close();

    Ok(())
}
