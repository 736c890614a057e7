//! Networker over the visor's route-group layer

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use dmsg_core::netutil::{PortGuard, Porter};
use dmsg_protocol::PubKey;

use crate::addr::{Addr, NetType};
use crate::conn::{Conn, RawConn};
use crate::error::AppnetError;
use crate::networker::{check_net, Listener, Networker};
use crate::Result;

/// Default bound of each listener's queue of unaccepted connections
pub const DEFAULT_QUEUE_SIZE: usize = 64;

/// A set of routes carrying one bidirectional connection
pub struct RouteGroup {
    /// Port on our side the routes terminate at
    pub local_port: u16,
    /// Far end of the routes
    pub remote: dmsg_protocol::Addr,
    pub conn: Box<dyn RawConn>,
}

impl fmt::Debug for RouteGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteGroup")
            .field("local_port", &self.local_port)
            .field("remote", &self.remote)
            .finish()
    }
}

/// The router underneath skynet
#[async_trait]
pub trait RouteGroupLayer: Send + Sync + 'static {
    /// Set up routes from `local_port` to `remote:remote_port`
    async fn dial_routes(
        &self,
        remote: PubKey,
        local_port: u16,
        remote_port: u16,
    ) -> io::Result<RouteGroup>;

    /// Wait for the next route group set up by a remote dialer
    async fn accept_routes(&self) -> io::Result<RouteGroup>;
}

#[derive(Clone)]
enum PortUse {
    Listener(mpsc::Sender<Conn>),
    Conn,
}

struct Inner {
    local_pk: PubKey,
    layer: Arc<dyn RouteGroupLayer>,
    porter: Porter<PortUse>,
    serving: AtomicBool,
    queue_size: usize,
    shutdown: CancellationToken,
    span: tracing::Span,
}

/// [`Networker`] for [`NetType::Skynet`]
///
/// The first listener starts a single accept loop that pulls route groups
/// from the layer and hands each to the listener bound to its local port.
/// A group for an unbound port, or for a listener whose queue is full, is
/// closed and logged.
pub struct SkywireNetworker {
    inner: Arc<Inner>,
}

impl SkywireNetworker {
    pub fn new(local_pk: PubKey, layer: Arc<dyn RouteGroupLayer>) -> Self {
        Self {
            inner: Arc::new(Inner {
                local_pk,
                layer,
                porter: Porter::new(),
                serving: AtomicBool::new(false),
                queue_size: DEFAULT_QUEUE_SIZE,
                shutdown: CancellationToken::new(),
                span: tracing::info_span!("skynet", pk = %local_pk),
            }),
        }
    }

    /// Bound each listener's queue at `size` connections
    pub fn with_queue_size(mut self, size: usize) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.queue_size = size.max(1);
        }
        self
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.span = span;
        }
        self
    }

    /// Whether the accept loop is running
    pub fn is_serving(&self) -> bool {
        self.inner.serving.load(Ordering::Acquire)
    }

    /// Ports currently held by listeners and dialed connections
    pub fn bound_ports(&self) -> Vec<u16> {
        self.inner
            .porter
            .port_values()
            .into_iter()
            .map(|(port, _)| port)
            .collect()
    }

    /// Stop the accept loop
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    fn ensure_serving(&self) {
        if self
            .inner
            .serving
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let span = inner.span.clone();
        tokio::spawn(async move { inner.serve().await }.instrument(span));
    }
}

impl Drop for SkywireNetworker {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    async fn serve(&self) {
        tracing::debug!("Route accept loop started");
        loop {
            let rg = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                res = self.layer.accept_routes() => match res {
                    Ok(rg) => rg,
                    Err(e) => {
                        tracing::error!(error = %e, "Accepting routes failed");
                        break;
                    }
                },
            };
            self.dispatch(rg);
        }
        self.serving.store(false, Ordering::Release);
        tracing::debug!("Route accept loop stopped");
    }

    fn dispatch(&self, rg: RouteGroup) {
        let port = rg.local_port;
        let tx = match self.porter.port_value(port) {
            Some(PortUse::Listener(tx)) => tx,
            Some(PortUse::Conn) | None => {
                tracing::warn!(port, remote = %rg.remote, "No listener on port, closing route group");
                return;
            }
        };

        let conn = Conn::new(
            rg.conn,
            Addr::skynet(self.local_pk, port),
            Addr::skynet(rg.remote.pk, rg.remote.port),
            None,
        );
        match tx.try_send(conn) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(conn)) => {
                tracing::warn!(port, remote = %conn.remote_addr(), "Listener queue full, closing connection");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(port, "Listener closed during dispatch");
            }
        }
    }
}

#[async_trait]
impl Networker for SkywireNetworker {
    fn net_type(&self) -> NetType {
        NetType::Skynet
    }

    async fn dial(&self, addr: Addr) -> Result<Conn> {
        check_net(NetType::Skynet, &addr)?;
        let (port, guard) = self
            .inner
            .porter
            .reserve_ephemeral(PortUse::Conn)
            .ok_or(AppnetError::NoEphemeralPorts)?;

        // The guard gives the port back if dialing fails.
        let rg = self.inner.layer.dial_routes(addr.pk, port, addr.port).await?;
        tracing::debug!(parent: &self.inner.span, local_port = port, remote = %addr, "Routes dialed");

        Ok(Conn::new(
            rg.conn,
            Addr::skynet(self.inner.local_pk, port),
            addr,
            Some(guard),
        ))
    }

    async fn listen(&self, addr: Addr) -> Result<Box<dyn Listener>> {
        check_net(NetType::Skynet, &addr)?;
        if addr.port == 0 {
            return Err(AppnetError::InvalidPort(0));
        }

        let (tx, rx) = mpsc::channel(self.inner.queue_size);
        let guard = self
            .inner
            .porter
            .reserve(addr.port, PortUse::Listener(tx))
            .ok_or(AppnetError::PortAlreadyBound(addr.port))?;
        self.ensure_serving();

        Ok(Box::new(SkynetListener {
            addr: Addr::skynet(self.inner.local_pk, addr.port),
            rx: Mutex::new(rx),
            closed: CancellationToken::new(),
            port: guard,
        }))
    }
}

struct SkynetListener {
    addr: Addr,
    rx: Mutex<mpsc::Receiver<Conn>>,
    closed: CancellationToken,
    port: PortGuard,
}

#[async_trait]
impl Listener for SkynetListener {
    async fn accept(&self) -> Result<Conn> {
        if self.closed.is_cancelled() {
            return Err(AppnetError::ListenerClosed);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(AppnetError::ListenerClosed),
            conn = rx.recv() => conn.ok_or(AppnetError::ListenerClosed),
        }
    }

    fn close(&self) {
        self.closed.cancel();
        if !self.port.release() {
            return;
        }
        tracing::debug!(port = self.addr.port, "Listener closed");
        // Queued connections would never be accepted now.
        if let Ok(mut rx) = self.rx.try_lock() {
            rx.close();
            while rx.try_recv().is_ok() {}
        }
    }

    fn addr(&self) -> Addr {
        self.addr
    }
}

impl Drop for SkynetListener {
    fn drop(&mut self) {
        Listener::close(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::Mutex as AsyncMutex;

    use dmsg_protocol::cipher::generate_keypair;

    /// Route layer fed by the test: inbound groups come from a channel and
    /// dialed groups hand their far end back to the test.
    struct MockLayer {
        inbound: AsyncMutex<mpsc::Receiver<RouteGroup>>,
        dialed: mpsc::UnboundedSender<(u16, DuplexStream)>,
        accepting: AtomicUsize,
        max_accepting: AtomicUsize,
        refuse_dials: AtomicBool,
    }

    #[async_trait]
    impl RouteGroupLayer for MockLayer {
        async fn dial_routes(
            &self,
            remote: PubKey,
            local_port: u16,
            remote_port: u16,
        ) -> io::Result<RouteGroup> {
            if self.refuse_dials.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "no route"));
            }
            let (ours, theirs) = tokio::io::duplex(1024);
            let _ = self.dialed.send((local_port, theirs));
            Ok(RouteGroup {
                local_port,
                remote: dmsg_protocol::Addr::new(remote, remote_port),
                conn: Box::new(ours),
            })
        }

        async fn accept_routes(&self) -> io::Result<RouteGroup> {
            let now = self.accepting.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_accepting.fetch_max(now, Ordering::SeqCst);
            let rg = self.inbound.lock().await.recv().await;
            self.accepting.fetch_sub(1, Ordering::SeqCst);
            rg.ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "router closed"))
        }
    }

    struct Harness {
        net: SkywireNetworker,
        layer: Arc<MockLayer>,
        inbound: mpsc::Sender<RouteGroup>,
        dialed: mpsc::UnboundedReceiver<(u16, DuplexStream)>,
        pk: PubKey,
    }

    fn harness(queue_size: usize) -> Harness {
        let (inbound, inbound_rx) = mpsc::channel(16);
        let (dialed_tx, dialed) = mpsc::unbounded_channel();
        let layer = Arc::new(MockLayer {
            inbound: AsyncMutex::new(inbound_rx),
            dialed: dialed_tx,
            accepting: AtomicUsize::new(0),
            max_accepting: AtomicUsize::new(0),
            refuse_dials: AtomicBool::new(false),
        });
        let (pk, _) = generate_keypair();
        let net = SkywireNetworker::new(pk, layer.clone()).with_queue_size(queue_size);
        Harness {
            net,
            layer,
            inbound,
            dialed,
            pk,
        }
    }

    /// An inbound route group to `port`, plus the remote end of it
    fn route_to(port: u16) -> (RouteGroup, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(1024);
        let (remote, _) = generate_keypair();
        let rg = RouteGroup {
            local_port: port,
            remote: dmsg_protocol::Addr::new(remote, 50000),
            conn: Box::new(ours),
        };
        (rg, theirs)
    }

    async fn assert_closed(mut remote: DuplexStream) {
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), remote.read(&mut buf))
            .await
            .expect("route group left open")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_listen_port_exclusive_until_closed() {
        let h = harness(4);
        let l = h.net.listen(Addr::skynet(h.pk, 80)).await.unwrap();
        assert!(matches!(
            h.net.listen(Addr::skynet(h.pk, 80)).await,
            Err(AppnetError::PortAlreadyBound(80))
        ));

        l.close();
        l.close();
        assert!(matches!(l.accept().await, Err(AppnetError::ListenerClosed)));
        let again = h.net.listen(Addr::skynet(h.pk, 80)).await.unwrap();
        assert_eq!(again.addr(), Addr::skynet(h.pk, 80));
    }

    #[tokio::test]
    async fn test_listen_rejects_other_networks_and_port_zero() {
        let h = harness(4);
        assert!(matches!(
            h.net.listen(Addr::dmsg(h.pk, 80)).await,
            Err(AppnetError::WrongNetType { .. })
        ));
        assert!(matches!(
            h.net.listen(Addr::skynet(h.pk, 0)).await,
            Err(AppnetError::InvalidPort(0))
        ));
    }

    #[tokio::test]
    async fn test_inbound_routes_dispatched_by_port() {
        let h = harness(4);
        let l80 = h.net.listen(Addr::skynet(h.pk, 80)).await.unwrap();
        let l81 = h.net.listen(Addr::skynet(h.pk, 81)).await.unwrap();

        let (rg, mut remote81) = route_to(81);
        h.inbound.send(rg).await.unwrap();
        let (rg, remote99) = route_to(99);
        h.inbound.send(rg).await.unwrap();
        let (rg, mut remote80) = route_to(80);
        h.inbound.send(rg).await.unwrap();

        let mut c81 = l81.accept().await.unwrap();
        assert_eq!(c81.local_addr(), Addr::skynet(h.pk, 81));
        assert_eq!(c81.remote_addr().port, 50000);
        c81.write_all(b"81").await.unwrap();
        let mut buf = [0u8; 2];
        remote81.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"81");

        let mut c80 = l80.accept().await.unwrap();
        remote80.write_all(b"80").await.unwrap();
        c80.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"80");

        assert_closed(remote99).await;
        assert_eq!(h.layer.max_accepting.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_full_queue_closes_connection() {
        let h = harness(1);
        let l = h.net.listen(Addr::skynet(h.pk, 80)).await.unwrap();

        let (rg, _kept) = route_to(80);
        h.inbound.send(rg).await.unwrap();
        let (rg, dropped) = route_to(80);
        h.inbound.send(rg).await.unwrap();

        assert_closed(dropped).await;
        assert_eq!(l.accept().await.unwrap().local_addr().port, 80);
    }

    #[tokio::test]
    async fn test_dial_holds_ephemeral_port_until_close() {
        let mut h = harness(4);
        let (remote, _) = generate_keypair();

        let mut conn = h.net.dial(Addr::skynet(remote, 80)).await.unwrap();
        let local = conn.local_addr();
        assert!(local.port >= dmsg_core::netutil::MIN_EPHEMERAL);
        assert_eq!(conn.remote_addr(), Addr::skynet(remote, 80));
        assert_eq!(h.net.bound_ports(), vec![local.port]);

        let (port, mut far) = h.dialed.recv().await.unwrap();
        assert_eq!(port, local.port);
        conn.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        far.read_exact(&mut buf).await.unwrap();

        conn.close().await.unwrap();
        assert!(h.net.bound_ports().is_empty());
    }

    #[tokio::test]
    async fn test_failed_dial_releases_port() {
        let h = harness(4);
        h.layer.refuse_dials.store(true, Ordering::SeqCst);
        let (remote, _) = generate_keypair();

        let err = h.net.dial(Addr::skynet(remote, 80)).await.unwrap_err();
        assert!(matches!(err, AppnetError::Io(_)));
        assert!(h.net.bound_ports().is_empty());
    }

    #[tokio::test]
    async fn test_accept_loop_stops_on_layer_error() {
        let h = harness(4);
        let _l = h.net.listen(Addr::skynet(h.pk, 80)).await.unwrap();
        assert!(h.net.is_serving());

        // Closing the inbound side makes accept_routes fail.
        drop(h.inbound);
        tokio::time::timeout(Duration::from_secs(2), async {
            while h.net.is_serving() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("accept loop kept running");
    }
}
