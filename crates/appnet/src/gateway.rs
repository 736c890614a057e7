//! RPC surface over a [`Networkers`] registry
//!
//! Lets a process without its own networkers dial, listen and move bytes
//! through connections held by the gateway, referring to them by id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use dmsg_core::rpc::{self, params, result, RpcClient, RpcError, RpcService};

use crate::addr::Addr;
use crate::conn::Conn;
use crate::error::AppnetError;
use crate::networker::{Listener, Networkers};
use crate::Result;

const DIAL: &str = "Dial";
const LISTEN: &str = "Listen";
const ACCEPT: &str = "Accept";
const READ: &str = "Read";
const WRITE: &str = "Write";
const CLOSE_CONN: &str = "CloseConn";
const CLOSE_LISTENER: &str = "CloseListener";

/// Largest single `Read` the gateway serves
const MAX_READ: usize = 64 * 1024;

/// A connection held by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnInfo {
    pub id: u64,
    pub local: Addr,
    pub remote: Addr,
}

#[derive(Serialize, Deserialize)]
struct ReadParams {
    id: u64,
    max: usize,
}

#[derive(Serialize, Deserialize)]
struct WriteParams {
    id: u64,
    data: Vec<u8>,
}

struct ConnSlot {
    reader: Mutex<ReadHalf<Conn>>,
    writer: Mutex<WriteHalf<Conn>>,
    closed: CancellationToken,
}

/// Serves the app networking RPC methods
pub struct AppGateway {
    networkers: Arc<Networkers>,
    conns: DashMap<u64, Arc<ConnSlot>>,
    listeners: DashMap<u64, Arc<dyn Listener>>,
    next_id: AtomicU64,
}

impl AppGateway {
    pub fn new(networkers: Arc<Networkers>) -> Self {
        Self {
            networkers,
            conns: DashMap::new(),
            listeners: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Serve RPC calls arriving on `io`
    pub async fn serve<T>(self: &Arc<Self>, io: T) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Ok(rpc::serve(io, Arc::clone(self)).await?)
    }

    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn hold(&self, conn: Conn) -> ConnInfo {
        let info = ConnInfo {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            local: conn.local_addr(),
            remote: conn.remote_addr(),
        };
        let (reader, writer) = tokio::io::split(conn);
        self.conns.insert(
            info.id,
            Arc::new(ConnSlot {
                reader: Mutex::new(reader),
                writer: Mutex::new(writer),
                closed: CancellationToken::new(),
            }),
        );
        info
    }

    fn conn(&self, id: u64) -> Result<Arc<ConnSlot>> {
        self.conns
            .get(&id)
            .map(|slot| Arc::clone(&slot))
            .ok_or(AppnetError::UnknownId(id))
    }

    async fn dispatch(&self, method: &str, args: Value) -> Result<Value> {
        match method {
            DIAL => {
                let addr: Addr = params(method, args)?;
                let conn = self.networkers.dial(addr).await?;
                Ok(result(self.hold(conn))?)
            }
            LISTEN => {
                let addr: Addr = params(method, args)?;
                let listener: Arc<dyn Listener> = Arc::from(self.networkers.listen(addr).await?);
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                self.listeners.insert(id, listener);
                Ok(Value::from(id))
            }
            ACCEPT => {
                let id: u64 = params(method, args)?;
                let listener = self
                    .listeners
                    .get(&id)
                    .map(|l| Arc::clone(&l))
                    .ok_or(AppnetError::UnknownId(id))?;
                let conn = listener.accept().await?;
                Ok(result(self.hold(conn))?)
            }
            READ => {
                let p: ReadParams = params(method, args)?;
                let slot = self.conn(p.id)?;
                let mut buf = vec![0u8; p.max.clamp(1, MAX_READ)];
                let mut reader = slot.reader.lock().await;
                let n = tokio::select! {
                    _ = slot.closed.cancelled() => 0,
                    n = reader.read(&mut buf) => n?,
                };
                buf.truncate(n);
                Ok(result(buf)?)
            }
            WRITE => {
                let p: WriteParams = params(method, args)?;
                let slot = self.conn(p.id)?;
                let mut writer = slot.writer.lock().await;
                writer.write_all(&p.data).await?;
                writer.flush().await?;
                Ok(Value::from(p.data.len()))
            }
            CLOSE_CONN => {
                let id: u64 = params(method, args)?;
                let (_, slot) = self.conns.remove(&id).ok_or(AppnetError::UnknownId(id))?;
                slot.closed.cancel();
                let mut writer = slot.writer.lock().await;
                if let Err(e) = writer.shutdown().await {
                    tracing::debug!(id, error = %e, "Conn shutdown failed");
                }
                Ok(Value::Null)
            }
            CLOSE_LISTENER => {
                let id: u64 = params(method, args)?;
                let (_, listener) = self.listeners.remove(&id).ok_or(AppnetError::UnknownId(id))?;
                listener.close();
                Ok(Value::Null)
            }
            other => Err(RpcError::UnknownMethod(other.to_string()).into()),
        }
    }
}

#[async_trait]
impl RpcService for AppGateway {
    async fn call(&self, method: &str, args: Value) -> std::result::Result<Value, String> {
        self.dispatch(method, args).await.map_err(|e| e.to_string())
    }
}

/// Typed client for an [`AppGateway`]
pub struct AppGatewayClient {
    rpc: RpcClient,
}

impl AppGatewayClient {
    pub fn new<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self {
            rpc: RpcClient::new(io),
        }
    }

    pub async fn dial(&self, addr: Addr) -> Result<ConnInfo> {
        Ok(self.rpc.call(DIAL, &addr).await?)
    }

    /// Returns the listener id
    pub async fn listen(&self, addr: Addr) -> Result<u64> {
        Ok(self.rpc.call(LISTEN, &addr).await?)
    }

    pub async fn accept(&self, listener: u64) -> Result<ConnInfo> {
        Ok(self.rpc.call(ACCEPT, &listener).await?)
    }

    /// Up to `max` bytes; empty at end of stream
    pub async fn read(&self, conn: u64, max: usize) -> Result<Vec<u8>> {
        Ok(self.rpc.call(READ, &ReadParams { id: conn, max }).await?)
    }

    pub async fn write(&self, conn: u64, data: &[u8]) -> Result<usize> {
        let p = WriteParams {
            id: conn,
            data: data.to_vec(),
        };
        Ok(self.rpc.call(WRITE, &p).await?)
    }

    pub async fn close_conn(&self, conn: u64) -> Result<()> {
        Ok(self.rpc.call(CLOSE_CONN, &conn).await?)
    }

    pub async fn close_listener(&self, listener: u64) -> Result<()> {
        Ok(self.rpc.call(CLOSE_LISTENER, &listener).await?)
    }
}
