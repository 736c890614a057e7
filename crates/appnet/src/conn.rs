//! Connections handed out by networkers

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use dmsg_core::netutil::PortGuard;

use crate::addr::Addr;

/// Transport under a [`Conn`]
pub trait RawConn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawConn for T {}

/// A connection on an app network
///
/// A dialed connection owns the local port it was given and returns it when
/// shut down or dropped, whichever comes first.
pub struct Conn {
    inner: Box<dyn RawConn>,
    local: Addr,
    remote: Addr,
    port: Option<PortGuard>,
}

impl Conn {
    pub fn new(inner: Box<dyn RawConn>, local: Addr, remote: Addr, port: Option<PortGuard>) -> Self {
        Self {
            inner,
            local,
            remote,
            port,
        }
    }

    pub fn local_addr(&self) -> Addr {
        self.local
    }

    pub fn remote_addr(&self) -> Addr {
        self.remote
    }

    /// Whether this connection still holds its local port
    pub fn holds_port(&self) -> bool {
        self.port.as_ref().is_some_and(|p| !p.is_released())
    }

    fn release_port(&self) {
        if let Some(port) = &self.port {
            if port.release() {
                tracing::trace!(port = port.port(), "Released conn port");
            }
        }
    }

    /// Shut the connection down and give back its port
    pub async fn close(&mut self) -> io::Result<()> {
        let res = self.inner.shutdown().await;
        self.release_port();
        res
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let res = Pin::new(&mut *self.inner).poll_shutdown(cx);
        if res.is_ready() {
            self.release_port();
        }
        res
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("port", &self.port)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmsg_core::netutil::Porter;
    use dmsg_protocol::cipher::generate_keypair;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_close_releases_port_once() {
        let porter: Porter<()> = Porter::new();
        let (port, guard) = porter.reserve_ephemeral(()).unwrap();
        let (pk, _) = generate_keypair();
        let (a, mut b) = tokio::io::duplex(64);

        let mut conn = Conn::new(
            Box::new(a),
            Addr::skynet(pk, port),
            Addr::skynet(pk, 80),
            Some(guard),
        );
        assert!(conn.holds_port());

        conn.write_all(b"hi").await.unwrap();
        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert!(!conn.holds_port());
        assert!(!porter.is_reserved(port));

        let mut out = Vec::new();
        b.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hi");
    }

    #[tokio::test]
    async fn test_drop_releases_port() {
        let porter: Porter<()> = Porter::new();
        let guard = porter.reserve(1000, ()).unwrap();
        let (pk, _) = generate_keypair();
        let (a, _b) = tokio::io::duplex(64);

        let conn = Conn::new(Box::new(a), Addr::skynet(pk, 1000), Addr::skynet(pk, 80), Some(guard));
        drop(conn);
        assert!(!porter.is_reserved(1000));
    }
}
