//! pty host: serves local CLI connections and whitelisted dmsg peers

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use dmsg::{Client, Listener};
use dmsg_core::config::CliNet;
use dmsg_core::rpc;
use dmsg_protocol::PubKey;

use crate::client::PtyClient;
use crate::error::PtyError;
use crate::gateway::{CfgGateway, LocalPtyGateway, ProxyGateway, PtyService};
use crate::request::Request;
use crate::whitelist::Whitelist;

#[derive(Debug, Clone, Copy)]
enum Origin {
    Cli,
    Dmsg(PubKey),
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Cli => write!(f, "cli"),
            Origin::Dmsg(pk) => write!(f, "dmsg:{}", pk),
        }
    }
}

/// Decrements an active-connection counter when the connection ends
struct Active<'a>(&'a AtomicUsize);

impl<'a> Active<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for Active<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

struct HostInner {
    client: Client,
    whitelist: Arc<dyn Whitelist>,
    cli_conns: AtomicUsize,
    stream_conns: AtomicUsize,
    next_conn: AtomicU64,
    shutdown: CancellationToken,
    span: tracing::Span,
}

/// dmsgpty host
///
/// CLI connections are trusted and may ask for whitelist configuration, a
/// local pty, or a pty on another host proxied over dmsg. Connections
/// arriving over dmsg must come from a whitelisted key and may only ask
/// for a local pty; anything else is closed without a reply.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    pub fn new(client: Client, whitelist: Arc<dyn Whitelist>) -> Self {
        let span = tracing::info_span!("dmsgpty_host", pk = %client.local_pk());
        Self {
            inner: Arc::new(HostInner {
                client,
                whitelist,
                cli_conns: AtomicUsize::new(0),
                stream_conns: AtomicUsize::new(0),
                next_conn: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
                span,
            }),
        }
    }

    /// Replace the span that scopes this host's logs
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.span = span;
        }
        self
    }

    pub fn local_pk(&self) -> PubKey {
        self.inner.client.local_pk()
    }

    pub fn whitelist(&self) -> &Arc<dyn Whitelist> {
        &self.inner.whitelist
    }

    /// Active CLI connections
    pub fn cli_connections(&self) -> usize {
        self.inner.cli_conns.load(Ordering::Relaxed)
    }

    /// Active dmsg stream connections
    pub fn stream_connections(&self) -> usize {
        self.inner.stream_conns.load(Ordering::Relaxed)
    }

    /// Listen on dmsg `port` and serve remote peers until closed
    pub async fn listen_and_serve(&self, port: u16) -> Result<(), PtyError> {
        let listener = self.inner.client.listen(port)?;
        self.serve_dmsg(listener).await
    }

    pub async fn serve_dmsg(&self, listener: Listener) -> Result<(), PtyError> {
        tracing::info!(parent: &self.inner.span, addr = %listener.addr(), "Serving dmsg pty requests");

        let result = loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break Ok(()),
                res = listener.accept() => match res {
                    Ok(stream) => {
                        let remote = stream.remote_addr().pk;
                        self.spawn_conn(stream, Origin::Dmsg(remote));
                    }
                    Err(e) if self.inner.shutdown.is_cancelled() => {
                        tracing::debug!(parent: &self.inner.span, error = %e, "dmsg listener closed");
                        break Ok(());
                    }
                    Err(e) => break Err(e.into()),
                },
            }
        };

        listener.close();
        result
    }

    /// Listen for CLI connections on `net`/`addr` until closed
    ///
    /// A Unix socket file is removed before binding and again on return.
    pub async fn serve_cli(&self, net: CliNet, addr: &str) -> Result<(), PtyError> {
        match net {
            CliNet::Tcp => {
                let listener = TcpListener::bind(addr).await?;
                self.serve_cli_tcp(listener).await
            }
            #[cfg(unix)]
            CliNet::Unix => {
                match tokio::fs::remove_file(addr).await {
                    Ok(()) => tracing::debug!(parent: &self.inner.span, path = addr, "Removed stale CLI socket"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                let listener = tokio::net::UnixListener::bind(addr)?;
                let result = self.serve_cli_unix(listener).await;
                if let Err(e) = tokio::fs::remove_file(addr).await {
                    tracing::debug!(parent: &self.inner.span, path = addr, error = %e, "Failed to remove CLI socket");
                }
                result
            }
            #[cfg(not(unix))]
            CliNet::Unix => Err(PtyError::Request(
                "unix CLI sockets are not supported on this platform".to_string(),
            )),
        }
    }

    pub async fn serve_cli_tcp(&self, listener: TcpListener) -> Result<(), PtyError> {
        tracing::info!(parent: &self.inner.span, addr = ?listener.local_addr().ok(), "Serving CLI over TCP");

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return Ok(()),
                res = listener.accept() => match res {
                    Ok((conn, peer)) => {
                        if !peer.ip().is_loopback() {
                            tracing::warn!(parent: &self.inner.span, %peer, "Rejected non-local CLI connection");
                            continue;
                        }
                        let _ = conn.set_nodelay(true);
                        self.spawn_conn(conn, Origin::Cli);
                    }
                    Err(e) => {
                        tracing::error!(parent: &self.inner.span, error = %e, "Failed to accept CLI connection");
                    }
                },
            }
        }
    }

    #[cfg(unix)]
    pub async fn serve_cli_unix(&self, listener: tokio::net::UnixListener) -> Result<(), PtyError> {
        tracing::info!(parent: &self.inner.span, "Serving CLI over Unix socket");

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return Ok(()),
                res = listener.accept() => match res {
                    Ok((conn, _)) => self.spawn_conn(conn, Origin::Cli),
                    Err(e) => {
                        tracing::error!(parent: &self.inner.span, error = %e, "Failed to accept CLI connection");
                    }
                },
            }
        }
    }

    /// Stop accepting and drop in-flight connections
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    fn spawn_conn<T>(&self, io: T, origin: Origin)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let id = inner.next_conn.fetch_add(1, Ordering::Relaxed);
        let span = tracing::info_span!(parent: &inner.span, "conn", id, %origin);

        tokio::spawn(
            async move {
                let shutdown = inner.shutdown.clone();
                tokio::select! {
                    _ = shutdown.cancelled() => tracing::debug!("Connection dropped on shutdown"),
                    res = handle_conn(&inner, io, origin) => match res {
                        Ok(()) => tracing::debug!("Connection closed"),
                        Err(e) => tracing::warn!(error = %e, "Connection failed"),
                    },
                }
            }
            .instrument(span),
        );
    }
}

async fn handle_conn<T>(inner: &HostInner, mut io: T, origin: Origin) -> Result<(), PtyError>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let _active = Active::enter(match origin {
        Origin::Cli => &inner.cli_conns,
        Origin::Dmsg(_) => &inner.stream_conns,
    });

    if let Origin::Dmsg(remote) = origin {
        if !inner.whitelist.get(&remote).await? {
            tracing::info!(%remote, "Peer not whitelisted, closing");
            return Ok(());
        }
    }

    let req = Request::read_from(&mut io).await?;
    let local_pk = inner.client.local_pk();
    tracing::info!(request = ?req, "Request received");

    let served = match (req, origin) {
        (Request::Cfg, Origin::Cli) => {
            rpc::serve(io, Arc::new(CfgGateway::new(Arc::clone(&inner.whitelist)))).await
        }
        (req @ Request::Pty { .. }, _) if req.is_local_to(&local_pk) => {
            let gateway = Arc::new(LocalPtyGateway::new());
            rpc::serve(io, Arc::new(PtyService::new(gateway))).await
        }
        (Request::Pty { dst }, Origin::Cli) => {
            tracing::info!(%dst, "Proxying pty to remote host");
            let mut stream = inner.client.dial_stream(dst).await?;
            Request::local_pty().write_to(&mut stream).await?;
            let gateway = Arc::new(ProxyGateway::new(PtyClient::new(stream)));
            rpc::serve(io, Arc::new(PtyService::new(gateway))).await
        }
        (_, Origin::Dmsg(_)) => {
            tracing::info!("Request not allowed over dmsg, closing");
            Ok(())
        }
    };
    Ok(served?)
}
