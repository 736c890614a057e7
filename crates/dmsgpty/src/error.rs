//! Error types for dmsgpty

use std::io;

use thiserror::Error;

use dmsg_core::rpc::RpcError;

/// Whitelist storage errors
#[derive(Error, Debug)]
pub enum WhitelistError {
    #[error("Whitelist I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Whitelist file is malformed: {0}")]
    Format(#[from] serde_json::Error),
}

/// Errors raised by pty hosts, gateways and clients
#[derive(Error, Debug)]
pub enum PtyError {
    /// A pty process is already running on this gateway
    #[error("pty already started")]
    AlreadyStarted,

    /// No pty process is running on this gateway
    #[error("pty not started")]
    NotStarted,

    /// The pty backend failed
    #[error("pty error: {0}")]
    Pty(String),

    /// Malformed connection request
    #[error("invalid request: {0}")]
    Request(String),

    /// The request is not allowed from this origin
    #[error("request refused: {0}")]
    Refused(&'static str),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Whitelist(#[from] WhitelistError),

    #[error(transparent)]
    Dmsg(#[from] dmsg::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PtyError {
    /// Build from any pty backend error
    pub(crate) fn pty(err: impl std::fmt::Display) -> Self {
        Self::Pty(err.to_string())
    }
}
