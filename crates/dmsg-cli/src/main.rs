//! dmsg CLI
//!
//! Single binary for dmsg operations:
//! - Relay server and in-memory discovery service
//! - dmsgpty host (serves remote peers and local CLI connections)
//! - dmsgpty CLI (whitelist management, interactive ptys)

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dmsg_cli::commands;
use dmsg_cli::output::print_error;
use dmsg_core::config::CliNet;
use dmsg_protocol::PubKey;

#[derive(Parser)]
#[command(name = "dmsg")]
#[command(author, version, about = "Relayed, multiplexed streams between public keys")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "DMSG_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log level (overrides -v/-q; RUST_LOG overrides both)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a relay server
    Server {
        /// Bind address (overrides config)
        #[arg(short, long)]
        bind: Option<String>,
        /// Address advertised in discovery
        #[arg(long)]
        public_address: Option<String>,
        /// Discovery service URL (overrides config)
        #[arg(long)]
        discovery: Option<String>,
    },

    /// Run an in-memory discovery service
    Discovery {
        /// Bind address
        #[arg(short, long, default_value = "127.0.0.1:9090")]
        bind: String,
    },

    /// Remote pseudo-terminals over dmsg
    Pty {
        #[command(subcommand)]
        action: PtyAction,
    },

    /// Generate a key pair
    Keygen {
        /// Derive the pair from a seed instead of randomly
        #[arg(long)]
        seed: Option<String>,
        /// Save the pair as TOML
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Overrides for the host's CLI listener
#[derive(Args)]
struct CliTarget {
    /// CLI network: unix or tcp
    #[arg(long)]
    cli_net: Option<CliNet>,
    /// CLI address: socket path or host:port
    #[arg(long)]
    cli_addr: Option<String>,
}

#[derive(Subcommand)]
enum PtyAction {
    /// Run a pty host
    Host {
        #[command(flatten)]
        target: CliTarget,
    },
    /// Show whitelisted keys
    Whitelist {
        #[command(flatten)]
        target: CliTarget,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add keys to the whitelist
    WhitelistAdd {
        #[command(flatten)]
        target: CliTarget,
        #[arg(required = true)]
        keys: Vec<PubKey>,
    },
    /// Remove keys from the whitelist
    WhitelistRemove {
        #[command(flatten)]
        target: CliTarget,
        #[arg(required = true)]
        keys: Vec<PubKey>,
    },
    /// Start an interactive pty through the local host
    Start {
        #[command(flatten)]
        target: CliTarget,
        /// Remote host public key (omit for a local pty)
        #[arg(long)]
        pk: Option<PubKey>,
        /// Remote host dmsg port
        #[arg(long, default_value_t = 22)]
        port: u16,
        /// Command to run (defaults to the user's shell)
        command: Option<String>,
        /// Arguments to the command (after `--` when they start with a dash)
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default config with fresh keys
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Show current configuration
    Show {
        /// Print the TOML as loaded
        #[arg(long)]
        raw: bool,
    },
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match (cli.quiet, cli.verbose, cli.log_level.as_deref()) {
        (_, _, Some(level)) => level.to_string(),
        (true, _, None) => "error".to_string(),
        (false, 0, None) => "warn".to_string(),
        (false, 1, None) => "info".to_string(),
        (false, 2, None) => "debug".to_string(),
        (false, _, None) => "trace".to_string(),
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or(log_level),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Err(e) = run(cli).await {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.config.as_ref();

    match cli.command {
        Commands::Server {
            bind,
            public_address,
            discovery,
        } => commands::server_command(config, bind, public_address, discovery).await,

        Commands::Discovery { bind } => commands::discovery_command(&bind).await,

        Commands::Pty { action } => match action {
            PtyAction::Host { target } => {
                commands::pty_host_command(config, target.cli_net, target.cli_addr).await
            }
            PtyAction::Whitelist { target, json } => {
                let host = commands::resolve_cli(config, target.cli_net, target.cli_addr)?;
                commands::whitelist_command(&host, json).await
            }
            PtyAction::WhitelistAdd { target, keys } => {
                let host = commands::resolve_cli(config, target.cli_net, target.cli_addr)?;
                commands::whitelist_add_command(&host, &keys).await
            }
            PtyAction::WhitelistRemove { target, keys } => {
                let host = commands::resolve_cli(config, target.cli_net, target.cli_addr)?;
                commands::whitelist_remove_command(&host, &keys).await
            }
            PtyAction::Start {
                target,
                pk,
                port,
                command,
                args,
            } => {
                let host = commands::resolve_cli(config, target.cli_net, target.cli_addr)?;
                let remote = pk.map(|pk| (pk, port));
                commands::pty_start_command(&host, remote, command, &args).await
            }
        },

        Commands::Keygen { seed, output } => {
            commands::keygen_command(seed.as_deref(), output.as_ref())
        }

        Commands::Config { action } => match action {
            ConfigAction::Init { force } => commands::config_init(config, force).map(|_| ()),
            ConfigAction::Show { raw } => commands::config_show(config, raw),
            ConfigAction::Path => {
                println!(
                    "{}",
                    config
                        .cloned()
                        .unwrap_or_else(dmsg_core::config::default_config_path)
                        .display()
                );
                Ok(())
            }
        },
    }
}
