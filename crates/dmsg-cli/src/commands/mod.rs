//! CLI command implementations

mod config;
mod discovery;
mod keygen;
mod pty;
mod server;

pub use config::{config_init, config_show, load_config_file};
pub use discovery::discovery_command;
pub use keygen::keygen_command;
pub use pty::{
    pty_host_command, pty_start_command, resolve_cli, whitelist_add_command, whitelist_command,
    whitelist_remove_command,
};
pub use server::server_command;

/// Resolve once Ctrl+C or SIGTERM arrives
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, initiating shutdown..."),
        _ = terminate => tracing::info!("Received SIGTERM, initiating shutdown..."),
    }
}
