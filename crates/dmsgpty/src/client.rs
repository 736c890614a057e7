//! RPC clients for the pty and cfg gateways

use tokio::io::{AsyncRead, AsyncWrite};

use dmsg_core::rpc::RpcClient;
use dmsg_protocol::PubKey;

use crate::error::PtyError;
use crate::gateway::{
    StartParams, READ, SET_PTY_SIZE, START, STOP, WHITELIST, WHITELIST_ADD, WHITELIST_REMOVE,
    WRITE,
};
use crate::pty::WinSize;
use crate::request::Request;

/// Talks to a pty gateway
pub struct PtyClient {
    rpc: RpcClient,
}

impl PtyClient {
    /// Wrap a connection whose request has already been sent
    pub fn new<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self {
            rpc: RpcClient::new(io),
        }
    }

    /// Send `req` on a fresh host connection and wrap it
    pub async fn connect<T>(mut io: T, req: Request) -> Result<Self, PtyError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if req == Request::Cfg {
            return Err(PtyError::Request("pty client needs a pty request".into()));
        }
        req.write_to(&mut io).await?;
        Ok(Self::new(io))
    }

    pub async fn start(&self, name: &str, args: &[String], size: WinSize) -> Result<(), PtyError> {
        let params = StartParams {
            name: name.to_string(),
            args: args.to_vec(),
            size,
        };
        Ok(self.rpc.call(START, &params).await?)
    }

    pub async fn stop(&self) -> Result<(), PtyError> {
        Ok(self.rpc.call(STOP, &()).await?)
    }

    /// Read up to `max` bytes; empty once the process has exited
    pub async fn read(&self, max: usize) -> Result<Vec<u8>, PtyError> {
        Ok(self.rpc.call(READ, &max).await?)
    }

    pub async fn write(&self, data: &[u8]) -> Result<usize, PtyError> {
        Ok(self.rpc.call(WRITE, data).await?)
    }

    pub async fn set_pty_size(&self, size: WinSize) -> Result<(), PtyError> {
        Ok(self.rpc.call(SET_PTY_SIZE, &size).await?)
    }
}

/// Talks to a cfg gateway
pub struct WhitelistClient {
    rpc: RpcClient,
}

impl WhitelistClient {
    pub fn new<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self {
            rpc: RpcClient::new(io),
        }
    }

    pub async fn connect<T>(mut io: T) -> Result<Self, PtyError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Request::Cfg.write_to(&mut io).await?;
        Ok(Self::new(io))
    }

    pub async fn view(&self) -> Result<Vec<PubKey>, PtyError> {
        Ok(self.rpc.call(WHITELIST, &()).await?)
    }

    pub async fn add(&self, pks: &[PubKey]) -> Result<(), PtyError> {
        Ok(self.rpc.call(WHITELIST_ADD, pks).await?)
    }

    pub async fn remove(&self, pks: &[PubKey]) -> Result<(), PtyError> {
        Ok(self.rpc.call(WHITELIST_REMOVE, pks).await?)
    }
}
