//! RPC gateways attached to host connections
//!
//! A pty connection is served by a [`PtyGateway`]: either the host's own
//! [`LocalPtyGateway`] or a [`ProxyGateway`] that forwards every call to a
//! remote host over an inner dmsg stream. A cfg connection is served by the
//! [`CfgGateway`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use dmsg_protocol::PubKey;

use dmsg_core::rpc::{params, result, RpcError, RpcService};

use crate::client::PtyClient;
use crate::error::PtyError;
use crate::pty::{LocalPty, WinSize};
use crate::whitelist::Whitelist;

pub(crate) const START: &str = "Start";
pub(crate) const STOP: &str = "Stop";
pub(crate) const READ: &str = "Read";
pub(crate) const WRITE: &str = "Write";
pub(crate) const SET_PTY_SIZE: &str = "SetPtySize";

pub(crate) const WHITELIST: &str = "Whitelist";
pub(crate) const WHITELIST_ADD: &str = "WhitelistAdd";
pub(crate) const WHITELIST_REMOVE: &str = "WhitelistRemove";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StartParams {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub size: WinSize,
}

/// The pty operations a CLI can drive
#[async_trait]
pub trait PtyGateway: Send + Sync {
    async fn start(&self, name: String, args: Vec<String>, size: WinSize) -> Result<(), PtyError>;

    async fn stop(&self) -> Result<(), PtyError>;

    async fn read(&self, max: usize) -> Result<Vec<u8>, PtyError>;

    async fn write(&self, data: Vec<u8>) -> Result<usize, PtyError>;

    async fn set_pty_size(&self, size: WinSize) -> Result<(), PtyError>;
}

/// Drives a pty on this host
#[derive(Default)]
pub struct LocalPtyGateway {
    pty: LocalPty,
}

impl LocalPtyGateway {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PtyGateway for LocalPtyGateway {
    async fn start(&self, name: String, args: Vec<String>, size: WinSize) -> Result<(), PtyError> {
        self.pty.start(&name, &args, size).await
    }

    async fn stop(&self) -> Result<(), PtyError> {
        self.pty.stop()
    }

    async fn read(&self, max: usize) -> Result<Vec<u8>, PtyError> {
        self.pty.read(max).await
    }

    async fn write(&self, data: Vec<u8>) -> Result<usize, PtyError> {
        self.pty.write(&data)
    }

    async fn set_pty_size(&self, size: WinSize) -> Result<(), PtyError> {
        self.pty.set_pty_size(size)
    }
}

/// Forwards every call to a remote host's gateway
pub struct ProxyGateway {
    remote: PtyClient,
}

impl ProxyGateway {
    pub fn new(remote: PtyClient) -> Self {
        Self { remote }
    }
}

#[async_trait]
impl PtyGateway for ProxyGateway {
    async fn start(&self, name: String, args: Vec<String>, size: WinSize) -> Result<(), PtyError> {
        self.remote.start(&name, &args, size).await
    }

    async fn stop(&self) -> Result<(), PtyError> {
        self.remote.stop().await
    }

    async fn read(&self, max: usize) -> Result<Vec<u8>, PtyError> {
        self.remote.read(max).await
    }

    async fn write(&self, data: Vec<u8>) -> Result<usize, PtyError> {
        self.remote.write(&data).await
    }

    async fn set_pty_size(&self, size: WinSize) -> Result<(), PtyError> {
        self.remote.set_pty_size(size).await
    }
}

/// Exposes a [`PtyGateway`] as RPC methods
pub(crate) struct PtyService {
    gateway: Arc<dyn PtyGateway>,
}

impl PtyService {
    pub(crate) fn new(gateway: Arc<dyn PtyGateway>) -> Self {
        Self { gateway }
    }
}

impl PtyService {
    async fn dispatch(&self, method: &str, args: Value) -> Result<Value, PtyError> {
        match method {
            START => {
                let p: StartParams = params(method, args)?;
                self.gateway.start(p.name, p.args, p.size).await?;
                Ok(Value::Null)
            }
            STOP => {
                self.gateway.stop().await?;
                Ok(Value::Null)
            }
            READ => {
                let max: usize = params(method, args)?;
                Ok(result(self.gateway.read(max).await?)?)
            }
            WRITE => {
                let data: Vec<u8> = params(method, args)?;
                Ok(Value::from(self.gateway.write(data).await?))
            }
            SET_PTY_SIZE => {
                let size: WinSize = params(method, args)?;
                self.gateway.set_pty_size(size).await?;
                Ok(Value::Null)
            }
            other => Err(RpcError::UnknownMethod(other.to_string()).into()),
        }
    }
}

#[async_trait]
impl RpcService for PtyService {
    async fn call(&self, method: &str, args: Value) -> Result<Value, String> {
        self.dispatch(method, args).await.map_err(|e| e.to_string())
    }
}

/// View and edit the host whitelist
pub struct CfgGateway {
    whitelist: Arc<dyn Whitelist>,
}

impl CfgGateway {
    pub fn new(whitelist: Arc<dyn Whitelist>) -> Self {
        Self { whitelist }
    }
}

impl CfgGateway {
    async fn dispatch(&self, method: &str, args: Value) -> Result<Value, PtyError> {
        match method {
            WHITELIST => Ok(result(self.whitelist.all().await?)?),
            WHITELIST_ADD => {
                let pks: Vec<PubKey> = params(method, args)?;
                self.whitelist.add(&pks).await?;
                tracing::info!(count = pks.len(), "Whitelist keys added");
                Ok(Value::Null)
            }
            WHITELIST_REMOVE => {
                let pks: Vec<PubKey> = params(method, args)?;
                self.whitelist.remove(&pks).await?;
                tracing::info!(count = pks.len(), "Whitelist keys removed");
                Ok(Value::Null)
            }
            other => Err(RpcError::UnknownMethod(other.to_string()).into()),
        }
    }
}

#[async_trait]
impl RpcService for CfgGateway {
    async fn call(&self, method: &str, args: Value) -> Result<Value, String> {
        self.dispatch(method, args).await.map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::WhitelistClient;
    use dmsg_core::rpc::serve;
    use crate::whitelist::MemoryWhitelist;
    use dmsg_protocol::cipher::generate_keypair;

    #[tokio::test]
    async fn test_cfg_gateway_over_rpc() {
        let whitelist = Arc::new(MemoryWhitelist::new());
        let (a, b) = tokio::io::duplex(4096);
        tokio::spawn(serve(b, Arc::new(CfgGateway::new(whitelist.clone()))));

        let client = WhitelistClient::new(a);
        let (pk, _) = generate_keypair();
        client.add(&[pk]).await.unwrap();
        client.add(&[pk]).await.unwrap();
        assert_eq!(client.view().await.unwrap(), vec![pk]);
        assert!(whitelist.get(&pk).await.unwrap());

        client.remove(&[pk]).await.unwrap();
        assert!(client.view().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pty_service_not_started() {
        let (a, b) = tokio::io::duplex(4096);
        let service = PtyService::new(Arc::new(LocalPtyGateway::new()));
        tokio::spawn(serve(b, Arc::new(service)));

        let client = PtyClient::new(a);
        let err = client.stop().await.unwrap_err();
        assert_eq!(err.to_string(), PtyError::NotStarted.to_string());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_proxy_gateway_forwards() {
        // client -> proxy service -> local service
        let (inner_a, inner_b) = tokio::io::duplex(4096);
        tokio::spawn(serve(
            inner_b,
            Arc::new(PtyService::new(Arc::new(LocalPtyGateway::new()))),
        ));
        let proxy = ProxyGateway::new(PtyClient::new(inner_a));

        let (outer_a, outer_b) = tokio::io::duplex(4096);
        tokio::spawn(serve(outer_b, Arc::new(PtyService::new(Arc::new(proxy)))));
        let client = PtyClient::new(outer_a);

        client
            .start("echo", &["through the proxy".to_string()], WinSize::default())
            .await
            .unwrap();
        let mut out = Vec::new();
        loop {
            let chunk = client.read(1024).await.unwrap();
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        assert!(String::from_utf8_lossy(&out).contains("through the proxy"));
        client.stop().await.unwrap();
    }
}
