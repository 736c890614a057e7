//! In-memory discovery service

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use super::shutdown_signal;
use crate::output::print_success;
use dmsg_core::disc::{router, MemoryDiscovery};

/// Serve the discovery HTTP API from memory until interrupted
///
/// Entries do not survive a restart.
pub async fn discovery_command(bind: &str) -> Result<()> {
    let store = Arc::new(MemoryDiscovery::new());
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;

    print_success(&format!(
        "Discovery service listening on http://{}",
        listener.local_addr()?
    ));

    axum::serve(listener, router(Arc::clone(&store)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Discovery service failed")?;

    tracing::info!(entries = store.len(), "Discovery service stopped");
    Ok(())
}
