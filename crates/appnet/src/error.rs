//! Error types for appnet

use std::io;

use thiserror::Error;

use crate::addr::NetType;

#[derive(Error, Debug)]
pub enum AppnetError {
    #[error("port {0} is already bound")]
    PortAlreadyBound(u16),

    #[error("invalid port {0}")]
    InvalidPort(u16),

    #[error("no free ephemeral ports")]
    NoEphemeralPorts,

    #[error("no networker registered for {0}")]
    NoSuchNetworker(NetType),

    #[error("networker for {0} is already registered")]
    NetworkerAlreadyExists(NetType),

    #[error("{networker} networker cannot serve {requested} addresses")]
    WrongNetType {
        networker: NetType,
        requested: NetType,
    },

    #[error("listener closed")]
    ListenerClosed,

    #[error("unknown connection or listener id {0}")]
    UnknownId(u64),

    #[error(transparent)]
    Dmsg(#[from] dmsg::Error),

    #[error(transparent)]
    Rpc(#[from] dmsg_core::rpc::RpcError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl AppnetError {
    /// Whether the caller may retry the same operation later
    pub fn is_temporary(&self) -> bool {
        match self {
            AppnetError::Dmsg(e) => e.is_temporary(),
            AppnetError::NoEphemeralPorts => true,
            _ => false,
        }
    }
}
