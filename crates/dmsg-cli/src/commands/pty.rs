//! dmsgpty host and CLI commands

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use super::{load_config_file, shutdown_signal};
use crate::output::{format_whitelist, print_info, print_success};
use dmsg::Client;
use dmsg_core::config::{ClientConfig, CliNet};
use dmsg_core::disc::{Discovery, HttpDiscovery};
use dmsg_protocol::PubKey;
use dmsgpty::{default_command, Cli, FileWhitelist, Host};

/// Where to reach the local host's CLI listener
///
/// Flags override the `[pty]` section of the config file.
pub fn resolve_cli(
    config_path: Option<&PathBuf>,
    net: Option<CliNet>,
    addr: Option<String>,
) -> Result<Cli> {
    let pty = load_config_file(config_path)?.pty;
    Ok(Cli::new(
        net.unwrap_or(pty.cli_net),
        addr.unwrap_or(pty.cli_addr),
    ))
}

/// Run a pty host until interrupted
pub async fn pty_host_command(
    config_path: Option<&PathBuf>,
    cli_net: Option<CliNet>,
    cli_addr: Option<String>,
) -> Result<()> {
    let file = load_config_file(config_path)?;
    let pty = file.pty;
    pty.keys.validate()?;

    let net = cli_net.unwrap_or(pty.cli_net);
    let addr = cli_addr.unwrap_or(pty.cli_addr);

    let client_config = ClientConfig {
        discovery_url: pty.discovery_url.clone(),
        min_sessions: pty.min_sessions,
        ..file.client
    };
    let discovery: Arc<dyn Discovery> = Arc::new(HttpDiscovery::new(pty.discovery_url.clone()));
    let client = Client::new(
        pty.keys.public_key,
        pty.keys.secret_key,
        discovery,
        client_config,
    );

    let whitelist = FileWhitelist::open(&pty.whitelist_path)
        .await
        .with_context(|| format!("Failed to open whitelist {:?}", pty.whitelist_path))?;
    let host = Host::new(client.clone(), Arc::new(whitelist));

    let serving = client.clone();
    let client_task = tokio::spawn(async move { serving.serve().await });

    print_success(&format!(
        "Pty host {} serving dmsg port {} and CLI on {}://{}",
        host.local_pk(),
        pty.port,
        net,
        addr
    ));

    let serve = async {
        tokio::try_join!(host.listen_and_serve(pty.port), host.serve_cli(net, &addr))
    };
    tokio::pin!(serve);

    let result = tokio::select! {
        res = &mut serve => res,
        _ = shutdown_signal() => {
            host.close();
            serve.await
        }
    };

    host.close();
    if let Err(e) = client.close().await {
        tracing::debug!("Client close: {}", e);
    }
    match client_task.await {
        Ok(Err(e)) => tracing::warn!("Client stopped with error: {}", e),
        Err(e) => tracing::warn!("Client task failed: {}", e),
        Ok(Ok(())) => {}
    }

    result.context("Pty host failed")?;
    Ok(())
}

/// Print the host's whitelist
pub async fn whitelist_command(cli: &Cli, json: bool) -> Result<()> {
    let keys = cli
        .whitelist_client()
        .await
        .with_context(|| format!("Failed to connect to pty host at {}://{}", cli.net, cli.addr))?
        .view()
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&keys)?);
    } else {
        println!("{}", format_whitelist(&keys));
    }
    Ok(())
}

pub async fn whitelist_add_command(cli: &Cli, keys: &[PubKey]) -> Result<()> {
    cli.whitelist_client()
        .await
        .with_context(|| format!("Failed to connect to pty host at {}://{}", cli.net, cli.addr))?
        .add(keys)
        .await?;
    print_success(&format!("Added {} key(s) to the whitelist", keys.len()));
    Ok(())
}

pub async fn whitelist_remove_command(cli: &Cli, keys: &[PubKey]) -> Result<()> {
    cli.whitelist_client()
        .await
        .with_context(|| format!("Failed to connect to pty host at {}://{}", cli.net, cli.addr))?
        .remove(keys)
        .await?;
    print_success(&format!("Removed {} key(s) from the whitelist", keys.len()));
    Ok(())
}

/// Start an interactive pty, locally or on the remote host `pk:port`
pub async fn pty_start_command(
    cli: &Cli,
    remote: Option<(PubKey, u16)>,
    command: Option<String>,
    args: &[String],
) -> Result<()> {
    let name = command.unwrap_or_else(default_command);

    match remote {
        Some((pk, port)) => {
            print_info(&format!("Starting {} on {}:{} (Ctrl+] to detach)", name, pk, port));
            cli.start_remote_pty(pk, port, &name, args).await?;
        }
        None => {
            print_info(&format!("Starting {} (Ctrl+] to detach)", name));
            cli.start_pty(&name, args).await?;
        }
    }
    Ok(())
}
