//! JSON RPC over any byte stream
//!
//! Messages are JSON documents behind a `u32` big-endian length prefix.
//! Servers run every call in its own task so a blocking `Read` does not
//! hold up a `Write` on the same connection; clients match responses to
//! calls by `id`.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

const OUTGOING_QUEUE: usize = 64;

/// RPC transport and call errors
#[derive(Error, Debug)]
pub enum RpcError {
    /// The serving end reported an error for this call
    #[error("{0}")]
    Remote(String),

    #[error("unknown RPC method: {0}")]
    UnknownMethod(String),

    #[error("bad params for {method}: {reason}")]
    BadParams { method: String, reason: String },

    /// The connection closed with the call outstanding
    #[error("RPC connection closed")]
    ConnectionClosed,

    #[error("RPC encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("RPC I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    fn from_result(id: u64, res: Result<Value, String>) -> Self {
        match res {
            Ok(v) => Self {
                id,
                result: Some(v),
                error: None,
            },
            Err(e) => Self {
                id,
                result: None,
                error: Some(e),
            },
        }
    }
}

/// Something that answers RPC calls by method name
///
/// The error string is handed to the caller as [`RpcError::Remote`].
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    async fn call(&self, method: &str, params: Value) -> Result<Value, String>;
}

/// Decode the params of `method`
pub fn params<P: DeserializeOwned>(method: &str, params: Value) -> Result<P, RpcError> {
    serde_json::from_value(params).map_err(|e| RpcError::BadParams {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

/// Encode a call result
pub fn result<R: Serialize>(value: R) -> Result<Value, RpcError> {
    Ok(serde_json::to_value(value)?)
}

/// Serve `service` on `io` until the peer hangs up
///
/// Calls still running when the connection ends are aborted.
pub async fn serve<T, S>(io: T, service: Arc<S>) -> Result<(), RpcError>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
    S: RpcService + ?Sized,
{
    let (mut sink, mut frames) = Framed::new(io, LengthDelimitedCodec::new()).split();
    let (tx, mut rx) = mpsc::channel::<RpcResponse>(OUTGOING_QUEUE);

    let writer = tokio::spawn(async move {
        while let Some(resp) = rx.recv().await {
            let body = serde_json::to_vec(&resp)?;
            sink.send(Bytes::from(body)).await?;
        }
        Ok::<_, RpcError>(())
    });

    let mut calls = JoinSet::new();
    let result = loop {
        let frame = match frames.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => break Err(e.into()),
            None => break Ok(()),
        };
        let req: RpcRequest = match serde_json::from_slice(&frame) {
            Ok(req) => req,
            Err(e) => break Err(e.into()),
        };

        tracing::trace!(id = req.id, method = %req.method, "RPC call");
        let service = Arc::clone(&service);
        let tx = tx.clone();
        calls.spawn(async move {
            let res = service.call(&req.method, req.params).await;
            let _ = tx.send(RpcResponse::from_result(req.id, res)).await;
        });
        // Reap finished calls so the set stays small on long connections.
        while calls.try_join_next().is_some() {}
    };

    calls.abort_all();
    drop(tx);
    while calls.join_next().await.is_some() {}
    match writer.await {
        Ok(Err(e)) if result.is_ok() => Err(e),
        _ => result,
    }
}

type Pending = DashMap<u64, oneshot::Sender<RpcResponse>>;

/// Client side of an RPC connection
pub struct RpcClient {
    outgoing: mpsc::Sender<Bytes>,
    pending: Arc<Pending>,
    next_id: AtomicU64,
    closed: CancellationToken,
    reader: JoinHandle<()>,
}

impl RpcClient {
    pub fn new<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut sink, mut frames) = Framed::new(io, LengthDelimitedCodec::new()).split();
        let (outgoing, mut rx) = mpsc::channel::<Bytes>(OUTGOING_QUEUE);
        let pending: Arc<Pending> = Arc::new(DashMap::new());
        let closed = CancellationToken::new();

        tokio::spawn(async move {
            while let Some(body) = rx.recv().await {
                if let Err(e) = sink.send(body).await {
                    tracing::debug!(error = %e, "RPC write failed");
                    return;
                }
            }
            let _ = sink.close().await;
        });

        let reader = {
            let pending = Arc::clone(&pending);
            let closed = closed.clone();
            tokio::spawn(async move {
                while let Some(Ok(frame)) = frames.next().await {
                    match serde_json::from_slice::<RpcResponse>(&frame) {
                        Ok(resp) => {
                            if let Some((_, tx)) = pending.remove(&resp.id) {
                                let _ = tx.send(resp);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Malformed RPC response");
                            break;
                        }
                    }
                }
                closed.cancel();
                pending.clear();
            })
        };

        Self {
            outgoing,
            pending,
            next_id: AtomicU64::new(1),
            closed,
            reader,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn call<P, R>(&self, method: &str, params: &P) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::to_vec(&RpcRequest {
            id,
            method: method.to_string(),
            params: serde_json::to_value(params)?,
        })?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        // The reader cancels before clearing, so an insert it missed is seen here.
        if self.closed.is_cancelled() {
            self.pending.remove(&id);
            return Err(RpcError::ConnectionClosed);
        }
        if self.outgoing.send(Bytes::from(body)).await.is_err() {
            self.pending.remove(&id);
            return Err(RpcError::ConnectionClosed);
        }

        let resp = rx.await.map_err(|_| RpcError::ConnectionClosed)?;
        if let Some(err) = resp.error {
            return Err(RpcError::Remote(err));
        }
        Ok(serde_json::from_value(resp.result.unwrap_or(Value::Null))?)
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
