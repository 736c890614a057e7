//! Client: session manager and entry point for dialing and listening
//!
//! A client keeps at least `min_sessions` sessions open to relay servers
//! picked from discovery, advertises those servers as its delegated servers,
//! and opens streams through whichever session reaches the destination.

use std::fmt;
use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use rand::seq::SliceRandom;
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use dmsg_core::backoff::ExponentialBackoff;
use dmsg_core::config::ClientConfig;
use dmsg_core::disc::{Discovery, Entry};
use dmsg_core::{DmsgError, Error, Result};
use dmsg_protocol::{Addr, PubKey, SecKey};

use crate::listener::{listener_queue, Listener};
use crate::registration::Registration;
use crate::session::{ClientSession, ClientShared, PortUse};
use crate::stream::Stream;

type DialHook = Arc<dyn Fn(&str) -> std::result::Result<(), String> + Send + Sync>;
type DisconnectHook = Arc<dyn Fn(&PubKey, &str, &str) + Send + Sync>;

/// Hooks into the session lifecycle
#[derive(Clone, Default)]
pub struct Callbacks {
    on_session_dial: Option<DialHook>,
    on_session_disconnect: Option<DisconnectHook>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with the server address before each session dial; an error
    /// vetoes the dial
    pub fn on_session_dial(
        mut self,
        f: impl Fn(&str) -> std::result::Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.on_session_dial = Some(Arc::new(f));
        self
    }

    /// Called with the server key, address and reason after a session ends
    pub fn on_session_disconnect(
        mut self,
        f: impl Fn(&PubKey, &str, &str) + Send + Sync + 'static,
    ) -> Self {
        self.on_session_disconnect = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_session_dial", &self.on_session_dial.is_some())
            .field("on_session_disconnect", &self.on_session_disconnect.is_some())
            .finish()
    }
}

struct ClientInner {
    shared: Arc<ClientShared>,
    registration: Registration,
    callbacks: Callbacks,
    sessions: DashMap<PubKey, Arc<ClientSession>>,
    connecting: DashMap<PubKey, Arc<tokio::sync::Mutex<()>>>,
    session_count: watch::Sender<usize>,
    ready: CancellationToken,
    changed: Notify,
    shutdown: CancellationToken,
    span: tracing::Span,
}

impl ClientInner {
    fn discovery(&self) -> &Arc<dyn Discovery> {
        self.registration.discovery()
    }

    fn publish_count(&self) {
        self.session_count.send_replace(self.sessions.len());
    }

    fn session_closed(&self, session: &Arc<ClientSession>) {
        let removed = self
            .sessions
            .remove_if(&session.server_pk(), |_, s| Arc::ptr_eq(s, session))
            .is_some();
        if !removed {
            return;
        }
        self.publish_count();
        self.changed.notify_one();

        let reason = session
            .close_reason()
            .unwrap_or_else(|| "unknown".to_string());
        tracing::warn!(
            parent: &self.span,
            server = %session.server_pk(),
            reason = %reason,
            "Lost session"
        );
        if let Some(hook) = &self.callbacks.on_session_disconnect {
            hook(&session.server_pk(), session.server_addr(), &reason);
        }
    }
}

/// dmsg client
///
/// Cheap to clone; clones share sessions, listeners and the port table.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(pk: PubKey, sk: SecKey, discovery: Arc<dyn Discovery>, config: ClientConfig) -> Self {
        Self::with_callbacks(pk, sk, discovery, config, Callbacks::default())
    }

    pub fn with_callbacks(
        pk: PubKey,
        sk: SecKey,
        discovery: Arc<dyn Discovery>,
        config: ClientConfig,
        callbacks: Callbacks,
    ) -> Self {
        let (session_count, _) = watch::channel(0);
        Self {
            inner: Arc::new(ClientInner {
                registration: Registration::new(sk.clone(), discovery),
                shared: Arc::new(ClientShared::new(pk, sk, config)),
                callbacks,
                sessions: DashMap::new(),
                connecting: DashMap::new(),
                session_count,
                ready: CancellationToken::new(),
                changed: Notify::new(),
                shutdown: CancellationToken::new(),
                span: tracing::info_span!("dmsg_client", pk = %pk),
            }),
        }
    }

    /// Replace the span that scopes this client's logs
    ///
    /// Only takes effect before the client is shared or started.
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.span = span;
        }
        self
    }

    pub fn local_pk(&self) -> PubKey {
        self.inner.shared.pk
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.shared.config
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Streams open across all sessions
    pub fn stream_count(&self) -> usize {
        self.inner.sessions.iter().map(|s| s.stream_count()).sum()
    }

    /// Keys of the servers this client has sessions with
    pub fn servers(&self) -> Vec<PubKey> {
        let mut servers: Vec<PubKey> = self.inner.sessions.iter().map(|s| *s.key()).collect();
        servers.sort();
        servers
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.is_cancelled()
    }

    /// Resolves once the first session is up
    pub async fn ready(&self) {
        self.inner.ready.cancelled().await
    }

    /// Wait until at least `n` sessions are up
    pub async fn wait_for_sessions(&self, n: usize) -> Result<()> {
        let mut count = self.inner.session_count.subscribe();
        let reached = async {
            loop {
                if *count.borrow_and_update() >= n {
                    return;
                }
                if count.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(DmsgError::EntityClosed.into()),
            _ = reached => Ok(()),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(DmsgError::EntityClosed.into());
        }
        Ok(())
    }

    /// Maintain sessions and the discovery entry until [`Client::close`]
    pub async fn serve(&self) -> Result<()> {
        self.check_open()?;
        let inner = &self.inner;
        let config = &inner.shared.config;
        let mut backoff = ExponentialBackoff::from_config(&config.backoff);
        let mut advertised: Option<(Vec<PubKey>, Instant)> = None;

        tracing::info!(parent: &inner.span, min_sessions = config.min_sessions, "Client serving");
        loop {
            let missing = config.min_sessions.saturating_sub(self.session_count());
            let retry = if missing == 0 {
                backoff.reset();
                None
            } else {
                match self.fill_sessions(missing).await {
                    Ok(()) if self.session_count() >= config.min_sessions => {
                        backoff.reset();
                        None
                    }
                    Ok(()) => Some(backoff.next_delay()),
                    Err(e) => {
                        tracing::warn!(parent: &inner.span, error = %e, "Failed to look up relay servers");
                        Some(backoff.next_delay())
                    }
                }
            };

            let servers = self.servers();
            let stale = match &advertised {
                Some((posted, at)) => *posted != servers || at.elapsed() >= config.update_interval,
                None => true,
            };
            if stale {
                match self.post_entry(servers.clone()).await {
                    Ok(()) => advertised = Some((servers, Instant::now())),
                    Err(e) => tracing::warn!(parent: &inner.span, error = %e, "Failed to update discovery entry"),
                }
            }

            let wait = retry.unwrap_or(config.update_interval);
            tokio::select! {
                _ = inner.shutdown.cancelled() => return Ok(()),
                _ = inner.changed.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Open sessions to up to `missing` servers we are not connected to
    async fn fill_sessions(&self, missing: usize) -> Result<()> {
        let mut candidates = self.inner.discovery().available_servers().await?;
        candidates.retain(|e| !self.inner.sessions.contains_key(&e.static_pk));
        candidates.shuffle(&mut rand::thread_rng());
        if candidates.is_empty() {
            tracing::debug!(parent: &self.inner.span, "No relay servers available");
        }

        let mut opened = 0;
        for entry in candidates {
            if opened >= missing || self.is_closed() {
                break;
            }
            let server = entry.static_pk;
            match self.connect_session(entry).await {
                Ok(_) => opened += 1,
                Err(e) => {
                    tracing::warn!(parent: &self.inner.span, server = %server, error = %e, "Session dial failed")
                }
            }
        }
        Ok(())
    }

    fn live_session(&self, server_pk: &PubKey) -> Option<Arc<ClientSession>> {
        self.inner
            .sessions
            .get(server_pk)
            .map(|s| Arc::clone(s.value()))
            .filter(|s| !s.is_closed())
    }

    /// Make sure a session to `server_pk` is up, dialing it if needed
    pub async fn ensure_session(&self, server_pk: PubKey) -> Result<()> {
        self.session_to(server_pk).await.map(|_| ())
    }

    async fn session_to(&self, server_pk: PubKey) -> Result<Arc<ClientSession>> {
        self.check_open()?;
        if let Some(session) = self.live_session(&server_pk) {
            return Ok(session);
        }

        let lock = Arc::clone(
            self.inner
                .connecting
                .entry(server_pk)
                .or_default()
                .value(),
        );
        let _guard = lock.lock().await;
        if let Some(session) = self.live_session(&server_pk) {
            return Ok(session);
        }

        let entry = self.inner.discovery().server_entry(&server_pk).await?;
        self.connect_session(entry).await
    }

    async fn connect_session(&self, entry: Entry) -> Result<Arc<ClientSession>> {
        let inner = &self.inner;
        let server_pk = entry.static_pk;
        let addr = entry
            .server
            .map(|s| s.address)
            .ok_or(DmsgError::DiscEntryIsNotServer)?;

        if let Some(hook) = &inner.callbacks.on_session_dial {
            hook(&addr).map_err(|reason| {
                io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("session dial to {} vetoed: {}", addr, reason),
                )
            })?;
        }

        tracing::debug!(parent: &inner.span, server = %server_pk, addr = %addr, "Dialing session");
        let tcp = tokio::time::timeout(inner.shared.config.dial_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Timeout("session dial"))??;
        tcp.set_nodelay(true)?;

        let session =
            ClientSession::establish(tcp, server_pk, addr, Arc::clone(&inner.shared)).await?;
        if self.is_closed() {
            session.close();
            return Err(DmsgError::EntityClosed.into());
        }
        self.register(Arc::clone(&session));
        Ok(session)
    }

    fn register(&self, session: Arc<ClientSession>) {
        let inner = &self.inner;
        if let Some(old) = inner.sessions.insert(session.server_pk(), Arc::clone(&session)) {
            old.close();
        }
        inner.publish_count();
        inner.ready.cancel();
        inner.changed.notify_one();

        let weak: Weak<ClientInner> = Arc::downgrade(inner);
        tokio::spawn(
            async move {
                session.wait_closed().await;
                if let Some(inner) = weak.upgrade() {
                    inner.session_closed(&session);
                }
            }
            .instrument(inner.span.clone()),
        );
    }

    /// Open a stream to `dst` through one of its delegated servers
    pub async fn dial_stream(&self, dst: Addr) -> Result<Stream> {
        self.check_open()?;
        let entry = self.inner.discovery().client_entry(&dst.pk).await?;
        let delegated = entry.delegated_servers();

        for server in delegated {
            if let Some(session) = self.live_session(server) {
                return session.dial(dst).await;
            }
        }
        for server in delegated {
            match self.session_to(*server).await {
                Ok(session) => return session.dial(dst).await,
                Err(e) => {
                    tracing::debug!(parent: &self.inner.span, server = %server, error = %e, "Delegated server unreachable")
                }
            }
        }
        Err(DmsgError::CannotConnectToDelegated.into())
    }

    /// Listen for streams addressed to `port`
    pub fn listen(&self, port: u16) -> Result<Listener> {
        self.check_open()?;
        if port == 0 {
            return Err(Error::InvalidPort(port));
        }
        let (handle, queue) = listener_queue(self.inner.shared.config.accept_queue_size);
        let guard = self
            .inner
            .shared
            .porter
            .reserve(port, PortUse::Listener(handle))
            .ok_or(DmsgError::PortOccupied)?;
        tracing::debug!(parent: &self.inner.span, port, "Listening");
        Ok(Listener::new(Addr::new(self.local_pk(), port), queue, guard))
    }

    async fn post_entry(&self, servers: Vec<PubKey>) -> Result<()> {
        let entry = Entry::client(self.local_pk(), servers);
        self.inner
            .registration
            .post_if(entry, || !self.is_closed())
            .await?;
        Ok(())
    }

    async fn withdraw_entry(&self) -> Result<()> {
        let entry = Entry::client(self.local_pk(), Vec::new());
        self.inner.registration.post(entry).await?;
        Ok(())
    }

    /// Close listeners and sessions, then withdraw delegated servers from
    /// discovery; later calls do nothing
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Ok(());
        }
        inner.shutdown.cancel();

        for (_, port_use) in inner.shared.porter.drain() {
            if let PortUse::Listener(listener) = port_use {
                listener.close();
            }
        }
        let sessions: Vec<Arc<ClientSession>> =
            inner.sessions.iter().map(|s| Arc::clone(s.value())).collect();
        inner.sessions.clear();
        inner.publish_count();
        for session in &sessions {
            session.close();
        }

        let withdrawn = tokio::time::timeout(Duration::from_secs(5), self.withdraw_entry()).await;
        match withdrawn {
            Ok(Err(e)) => tracing::warn!(parent: &inner.span, error = %e, "Failed to withdraw discovery entry"),
            Err(_) => tracing::warn!(parent: &inner.span, "Timed out withdrawing discovery entry"),
            Ok(Ok(())) => {}
        }
        tracing::info!(parent: &inner.span, sessions = sessions.len(), "Client closed");
        Ok(())
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("pk", &self.local_pk())
            .field("sessions", &self.session_count())
            .finish()
    }
}
