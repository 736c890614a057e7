//! dmsgpty: remote pseudo-terminals over dmsg
//!
//! A [`Host`] serves pty and whitelist RPC to local CLI connections and, for
//! whitelisted peers, to inbound dmsg streams. A CLI connection may also ask
//! the host to proxy its pty session to another host over dmsg. All gateway
//! traffic is the length-framed JSON RPC of [`dmsg_core::rpc`].

pub mod cli;
pub mod client;
pub mod error;
pub mod gateway;
pub mod host;
pub mod pty;
pub mod request;
pub mod whitelist;

pub use cli::Cli;
pub use client::{PtyClient, WhitelistClient};
pub use error::{PtyError, WhitelistError};
pub use gateway::{CfgGateway, LocalPtyGateway, ProxyGateway, PtyGateway};
pub use host::Host;
pub use pty::{LocalPty, WinSize};
pub use request::Request;
pub use whitelist::{FileWhitelist, MemoryWhitelist, Whitelist};

/// Shell started when a CLI asks for a pty without naming a command
pub fn default_command() -> String {
    if cfg!(windows) {
        "powershell.exe".to_string()
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}
