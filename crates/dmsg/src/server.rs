//! Relay server
//!
//! Accepts client sessions over TCP, registers itself in discovery and
//! relays streams between the clients connected to it.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use dmsg_core::config::ServerConfig;
use dmsg_core::disc::{Discovery, Entry};
use dmsg_core::{Error, Result};
use dmsg_protocol::{PubKey, SecKey};

use crate::registration::Registration;
use crate::session::{server_handshake, ServerSession, SessionMap};

struct ServerInner {
    pk: PubKey,
    sk: SecKey,
    config: ServerConfig,
    registration: Registration,
    sessions: Arc<SessionMap>,
    local_addr: OnceLock<SocketAddr>,
    shutdown: CancellationToken,
    span: tracing::Span,
}

/// dmsg relay server
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(pk: PubKey, sk: SecKey, discovery: Arc<dyn Discovery>, config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                pk,
                registration: Registration::new(sk.clone(), discovery),
                sk,
                config,
                sessions: Arc::new(SessionMap::new()),
                local_addr: OnceLock::new(),
                shutdown: CancellationToken::new(),
                span: tracing::info_span!("dmsg_server", pk = %pk),
            }),
        }
    }

    /// Replace the span that scopes this server's logs
    ///
    /// Only takes effect before the server is shared or started.
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.span = span;
        }
        self
    }

    pub fn local_pk(&self) -> PubKey {
        self.inner.pk
    }

    /// Address of the TCP listener, once serving
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get().copied()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Keys of the clients with a live session
    pub fn clients(&self) -> Vec<PubKey> {
        let mut clients: Vec<PubKey> = self
            .inner
            .sessions
            .iter()
            .map(|s| s.value().client_pk())
            .collect();
        clients.sort();
        clients
    }

    fn available_sessions(&self) -> usize {
        self.inner
            .config
            .max_sessions
            .saturating_sub(self.session_count())
    }

    async fn update_entry(&self, address: &str) -> Result<()> {
        let entry = Entry::server(self.inner.pk, address.to_string(), self.available_sessions());
        self.inner.registration.post(entry).await?;
        Ok(())
    }

    /// Accept sessions on `listener` until [`Server::close`]
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let inner = &self.inner;
        let local = listener.local_addr()?;
        let _ = inner.local_addr.set(local);
        let address = inner
            .config
            .public_address
            .clone()
            .unwrap_or_else(|| local.to_string());

        self.update_entry(&address).await?;
        tracing::info!(parent: &inner.span, %local, advertised = %address, "Relay server listening");

        let mut refresh = tokio::time::interval(inner.config.update_interval);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        refresh.tick().await;

        loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => {
                    tracing::info!(parent: &inner.span, "Relay server shutting down");
                    break;
                }

                _ = refresh.tick() => {
                    if let Err(e) = self.update_entry(&address).await {
                        tracing::warn!(parent: &inner.span, error = %e, "Failed to refresh discovery entry");
                    }
                }

                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => self.handle_connection(socket, peer),
                    Err(e) => tracing::error!(parent: &inner.span, error = %e, "Failed to accept connection"),
                },
            }
        }
        Ok(())
    }

    fn handle_connection(&self, socket: TcpStream, peer: SocketAddr) {
        let inner = Arc::clone(&self.inner);
        if inner.sessions.len() >= inner.config.max_sessions {
            tracing::warn!(parent: &inner.span, %peer, max = inner.config.max_sessions, "Session limit reached, dropping connection");
            return;
        }
        let _ = socket.set_nodelay(true);

        let span = inner.span.clone();
        tokio::spawn(
            async move {
                let handshake = tokio::time::timeout(
                    inner.config.handshake_timeout,
                    server_handshake(socket, inner.pk, &inner.sk),
                )
                .await
                .map_err(|_| Error::Timeout("session handshake"))
                .and_then(|r| r);

                match handshake {
                    Ok((client_pk, framed)) => {
                        if inner.shutdown.is_cancelled() {
                            return;
                        }
                        ServerSession::start(client_pk, framed, Arc::clone(&inner.sessions));
                        tracing::info!(%peer, client = %client_pk, "Client session established");
                    }
                    Err(e) => tracing::debug!(%peer, error = %e, "Session handshake failed"),
                }
            }
            .instrument(span),
        );
    }

    /// Stop accepting and close every client session
    pub fn close(&self) {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return;
        }
        inner.shutdown.cancel();
        let sessions: Vec<Arc<ServerSession>> =
            inner.sessions.iter().map(|s| Arc::clone(s.value())).collect();
        for session in &sessions {
            session.close();
        }
        tracing::info!(parent: &inner.span, sessions = sessions.len(), "Relay server closed");
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("pk", &self.inner.pk)
            .field("local_addr", &self.local_addr())
            .field("sessions", &self.session_count())
            .finish()
    }
}
