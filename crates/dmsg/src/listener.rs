//! Listener: accept queue for one local port

use std::fmt;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use dmsg_core::netutil::PortGuard;
use dmsg_core::{DmsgError, Result};
use dmsg_protocol::Addr;

use crate::stream::Stream;

/// Sending half of a listener's queue, registered in the port table
#[derive(Debug, Clone)]
pub(crate) struct ListenerHandle {
    tx: mpsc::Sender<Stream>,
    closed: CancellationToken,
}

/// Receiving half, owned by the [`Listener`] once its port is reserved
pub(crate) struct ListenerQueue {
    rx: mpsc::Receiver<Stream>,
    closed: CancellationToken,
}

/// Create the two halves of a listener queue
pub(crate) fn listener_queue(queue_size: usize) -> (ListenerHandle, ListenerQueue) {
    let (tx, rx) = mpsc::channel(queue_size.max(1));
    let closed = CancellationToken::new();
    let handle = ListenerHandle {
        tx,
        closed: closed.clone(),
    };
    (handle, ListenerQueue { rx, closed })
}

impl ListenerHandle {
    /// Claim a queue slot for a stream about to be accepted
    pub(crate) fn try_reserve(&self) -> std::result::Result<mpsc::Permit<'_, Stream>, DmsgError> {
        if self.closed.is_cancelled() {
            return Err(DmsgError::ReqNoListener);
        }
        self.tx.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(()) => DmsgError::AcceptChanMaxed,
            mpsc::error::TrySendError::Closed(()) => DmsgError::ReqNoListener,
        })
    }

    /// Wake the listener's accepters with `EntityClosed`
    pub(crate) fn close(&self) {
        self.closed.cancel();
    }
}

/// Accepts inbound streams addressed to one local port
///
/// Closing the listener (explicitly or by dropping it) frees the port for a
/// later `listen`, wakes every blocked `accept` with `EntityClosed` and
/// closes streams still waiting in the queue.
pub struct Listener {
    addr: Addr,
    rx: Mutex<mpsc::Receiver<Stream>>,
    closed: CancellationToken,
    port: PortGuard,
}

impl Listener {
    pub(crate) fn new(addr: Addr, queue: ListenerQueue, port: PortGuard) -> Self {
        Self {
            addr,
            rx: Mutex::new(queue.rx),
            closed: queue.closed,
            port,
        }
    }

    pub fn addr(&self) -> Addr {
        self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Wait for the next inbound stream
    pub async fn accept(&self) -> Result<Stream> {
        let mut rx = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(DmsgError::EntityClosed.into()),
            rx = self.rx.lock() => rx,
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(DmsgError::EntityClosed.into()),
            stream = rx.recv() => stream.ok_or_else(|| DmsgError::EntityClosed.into()),
        }
    }

    /// Stop accepting and release the port; later calls do nothing
    pub fn close(&self) {
        self.closed.cancel();
        if !self.port.release() {
            return;
        }
        tracing::debug!(addr = %self.addr, "Listener closed");

        // Streams accepted by a session but never handed out get closed.
        if let Ok(mut rx) = self.rx.try_lock() {
            rx.close();
            while let Ok(stream) = rx.try_recv() {
                drop(stream);
            }
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("addr", &self.addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}
