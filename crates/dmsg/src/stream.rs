//! Multiplexed streams
//!
//! A [`Stream`] is one duplex byte pipe between two dmsg addresses, carried
//! over a session and relayed by a server. Each direction is flow controlled:
//! a writer may have at most [`INITIAL_WINDOW`] unacknowledged bytes in
//! flight, and readers return credit with ACK frames as they consume data.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{ready, Context, Poll, Waker};
use std::time::Duration;

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Notify;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::PollSender;
use tracing::Instrument;

use dmsg_core::ids::IdManager;
use dmsg_core::netutil::PortGuard;
use dmsg_core::{DmsgError, Result};
use dmsg_protocol::{Addr, Frame, StreamId};

use crate::session::FrameSender;

/// Per-direction flow-control window
pub const INITIAL_WINDOW: usize = 1 << 18;

/// Largest DATA payload a stream writes
pub const MAX_DATA_CHUNK: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Broken {
    SessionClosed,
    Reset,
}

impl Broken {
    fn to_io(self) -> io::Error {
        match self {
            Broken::SessionClosed => {
                io::Error::new(io::ErrorKind::ConnectionAborted, DmsgError::SessionClosed)
            }
            Broken::Reset => io::Error::new(
                io::ErrorKind::ConnectionReset,
                "stream reset: receive window exceeded",
            ),
        }
    }
}

struct ReadState {
    queue: VecDeque<Bytes>,
    buffered: usize,
    unacked: usize,
    remote_closed: bool,
    /// Set by close(); inbound data is discarded from then on
    local_closed: bool,
    error: Option<Broken>,
    waker: Option<Waker>,
}

struct WriteState {
    credit: usize,
    local_closed: bool,
    error: Option<Broken>,
    waker: Option<Waker>,
}

fn wake(waker: &mut Option<Waker>) {
    if let Some(w) = waker.take() {
        w.wake();
    }
}

/// State shared between a [`Stream`] and the session read loop
pub(crate) struct StreamCore {
    id: StreamId,
    local: Addr,
    remote: Addr,
    frames: FrameSender,
    ids: IdManager<Arc<StreamCore>>,
    port: Option<PortGuard>,
    read: Mutex<ReadState>,
    write: Mutex<WriteState>,
    peer_closed: Notify,
    released: AtomicBool,
    close_timeout: Duration,
    span: tracing::Span,
}

impl StreamCore {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: StreamId,
        local: Addr,
        remote: Addr,
        frames: FrameSender,
        ids: IdManager<Arc<StreamCore>>,
        port: Option<PortGuard>,
        close_timeout: Duration,
        span: tracing::Span,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            local,
            remote,
            frames,
            ids,
            port,
            read: Mutex::new(ReadState {
                queue: VecDeque::new(),
                buffered: 0,
                unacked: 0,
                remote_closed: false,
                local_closed: false,
                error: None,
                waker: None,
            }),
            write: Mutex::new(WriteState {
                credit: INITIAL_WINDOW,
                local_closed: false,
                error: None,
                waker: None,
            }),
            peer_closed: Notify::new(),
            released: AtomicBool::new(false),
            close_timeout,
            span,
        })
    }

    fn read_state(&self) -> MutexGuard<'_, ReadState> {
        self.read.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> MutexGuard<'_, WriteState> {
        self.write.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ack(&self, credit: usize) {
        if credit > 0 {
            let _ = self.frames.send_ctrl(Frame::ack(self.id, credit as u32));
        }
    }

    /// DATA from the peer; Err when the peer overran the window
    pub(crate) fn on_data(&self, payload: Bytes) -> std::result::Result<(), ()> {
        let mut r = self.read_state();
        if r.local_closed {
            drop(r);
            self.ack(payload.len());
            return Ok(());
        }
        if r.remote_closed || r.error.is_some() {
            return Ok(());
        }
        if r.buffered + payload.len() > INITIAL_WINDOW {
            return Err(());
        }
        r.buffered += payload.len();
        r.queue.push_back(payload);
        wake(&mut r.waker);
        Ok(())
    }

    /// Credit returned by the peer
    pub(crate) fn on_ack(&self, credit: u32) {
        let mut w = self.write_state();
        w.credit = w.credit.saturating_add(credit as usize);
        wake(&mut w.waker);
    }

    /// CLOSE from the peer
    pub(crate) fn on_close(&self) {
        {
            let mut r = self.read_state();
            r.remote_closed = true;
            wake(&mut r.waker);
        }
        self.peer_closed.notify_one();
        if self.write_state().local_closed {
            self.release();
        }
    }

    /// The carrying session is gone
    pub(crate) fn on_session_closed(&self) {
        self.fail(Broken::SessionClosed);
        self.peer_closed.notify_one();
        self.release();
    }

    /// Abort the stream after a flow-control violation by the peer
    pub(crate) fn reset(self: &Arc<Self>) {
        tracing::warn!(parent: &self.span, stream = %self.id, "Peer exceeded receive window, resetting stream");
        self.fail(Broken::Reset);
        let _ = self.frames.send_ctrl(Frame::close(self.id));
        self.linger();
    }

    fn fail(&self, why: Broken) {
        {
            let mut r = self.read_state();
            r.error.get_or_insert(why);
            r.queue.clear();
            r.buffered = 0;
            wake(&mut r.waker);
        }
        let mut w = self.write_state();
        w.error.get_or_insert(why);
        wake(&mut w.waker);
    }

    /// Mark both directions closed locally; returns whether a CLOSE is owed
    fn begin_close(&self) -> bool {
        let discarded = {
            let mut r = self.read_state();
            r.local_closed = true;
            let discarded = r.buffered + r.unacked;
            r.queue.clear();
            r.buffered = 0;
            r.unacked = 0;
            wake(&mut r.waker);
            if r.remote_closed || r.error.is_some() {
                0
            } else {
                discarded
            }
        };
        self.ack(discarded);

        let mut w = self.write_state();
        let owed = !w.local_closed && w.error.is_none();
        w.local_closed = true;
        wake(&mut w.waker);
        owed
    }

    /// Release now if the peer already closed, otherwise wait for it
    fn finish_close(self: &Arc<Self>) {
        let done = {
            let r = self.read_state();
            r.remote_closed || r.error.is_some()
        };
        if done {
            self.release();
        } else {
            self.linger();
        }
    }

    fn linger(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.release();
            return;
        };
        let core = Arc::clone(self);
        handle.spawn(
            async move {
                let waited =
                    tokio::time::timeout(core.close_timeout, core.peer_closed.notified()).await;
                if waited.is_err() {
                    tracing::debug!(stream = %core.id, "Peer did not close stream in time, reclaiming id");
                }
                core.release();
            }
            .instrument(self.span.clone()),
        );
    }

    /// Give the stream ID and local port back; idempotent
    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.ids
            .remove_if(self.id.as_u16(), |v| std::ptr::eq(Arc::as_ptr(v), self));
        if let Some(port) = &self.port {
            port.release();
        }
        tracing::trace!(parent: &self.span, stream = %self.id, "Stream released");
    }

    #[cfg(test)]
    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

fn deadline_elapsed(deadline: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> bool {
    match deadline {
        Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
        None => false,
    }
}

fn timed_out(op: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{} deadline exceeded", op))
}

fn session_closed() -> io::Error {
    Broken::SessionClosed.to_io()
}

/// A multiplexed stream between two dmsg addresses
pub struct Stream {
    core: Arc<StreamCore>,
    sender: PollSender<Frame>,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
    closed: bool,
}

impl Stream {
    pub(crate) fn new(core: Arc<StreamCore>) -> Self {
        let sender = PollSender::new(core.frames.data_sender());
        Self {
            core,
            sender,
            read_deadline: None,
            write_deadline: None,
            closed: false,
        }
    }

    pub fn local_addr(&self) -> Addr {
        self.core.local
    }

    pub fn remote_addr(&self) -> Addr {
        self.core.remote
    }

    /// Session-scoped ID of this stream
    pub fn stream_id(&self) -> StreamId {
        self.core.id
    }

    /// Fail reads and writes still blocked at `deadline`; None clears it
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline.map(|d| Box::pin(tokio::time::sleep_until(d)));
    }

    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline.map(|d| Box::pin(tokio::time::sleep_until(d)));
    }

    /// Close both directions
    ///
    /// Sends CLOSE after any data already written and returns without
    /// waiting; the stream ID is reclaimed once the peer's CLOSE arrives or
    /// the close timeout passes.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.core.begin_close() {
            // A closed session already tore the stream down.
            let _ = self.core.frames.send(Frame::close(self.core.id)).await;
        }
        self.core.finish_close();
        Ok(())
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.core.id)
            .field("local", &self.core.local)
            .field("remote", &self.core.remote)
            .finish()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let mut credit = 0;
        let result = {
            let mut r = this.core.read_state();
            if let Some(front) = r.queue.front_mut() {
                let n = front.len().min(buf.remaining());
                buf.put_slice(&front[..n]);
                front.advance(n);
                if front.is_empty() {
                    r.queue.pop_front();
                }
                r.buffered -= n;
                r.unacked += n;
                if r.unacked >= INITIAL_WINDOW / 2 {
                    credit = r.unacked;
                    r.unacked = 0;
                }
                Poll::Ready(Ok(()))
            } else if r.remote_closed || r.local_closed {
                Poll::Ready(Ok(()))
            } else if let Some(err) = r.error {
                Poll::Ready(Err(err.to_io()))
            } else {
                r.waker = Some(cx.waker().clone());
                drop(r);
                if deadline_elapsed(&mut this.read_deadline, cx) {
                    Poll::Ready(Err(timed_out("read")))
                } else {
                    Poll::Pending
                }
            }
        };
        this.core.ack(credit);
        result
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        {
            let mut w = this.core.write_state();
            if let Some(err) = w.error {
                return Poll::Ready(Err(err.to_io()));
            }
            if w.local_closed {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "stream closed for writing",
                )));
            }
            if w.credit == 0 {
                w.waker = Some(cx.waker().clone());
                drop(w);
                if deadline_elapsed(&mut this.write_deadline, cx) {
                    return Poll::Ready(Err(timed_out("write")));
                }
                return Poll::Pending;
            }
        }

        match this.sender.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(_)) => return Poll::Ready(Err(session_closed())),
            Poll::Pending => {
                if deadline_elapsed(&mut this.write_deadline, cx) {
                    return Poll::Ready(Err(timed_out("write")));
                }
                return Poll::Pending;
            }
        }

        // Only this writer consumes credit, so it is still positive here.
        let n = {
            let mut w = this.core.write_state();
            let n = buf.len().min(w.credit).min(MAX_DATA_CHUNK);
            w.credit -= n;
            n
        };
        let frame = Frame::data(this.core.id, Bytes::copy_from_slice(&buf[..n]));
        this.sender
            .send_item(frame)
            .map_err(|_| session_closed())?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    /// Half-close: the peer reads EOF, reading from this side continues
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        {
            let w = this.core.write_state();
            if w.local_closed || w.error.is_some() {
                return Poll::Ready(Ok(()));
            }
        }

        ready!(this.sender.poll_reserve(cx)).map_err(|_| session_closed())?;
        this.core.write_state().local_closed = true;
        this.sender
            .send_item(Frame::close(this.core.id))
            .map_err(|_| session_closed())?;

        if this.core.read_state().remote_closed {
            this.core.release();
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.core.begin_close() {
            self.core.frames.send_nowait(Frame::close(self.core.id));
        }
        self.core.finish_close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_frame_sender;
    use dmsg_core::ids::Parity;
    use dmsg_protocol::cipher::generate_keypair;
    use dmsg_protocol::FrameType;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    struct Harness {
        stream: Stream,
        core: Arc<StreamCore>,
        ids: IdManager<Arc<StreamCore>>,
        data_rx: mpsc::Receiver<Frame>,
        ctrl_rx: mpsc::UnboundedReceiver<Frame>,
    }

    fn harness(close_timeout: Duration) -> Harness {
        let (frames, data_rx, ctrl_rx) = test_frame_sender(4);
        let ids = IdManager::new(Parity::Even);
        let (a, _) = generate_keypair();
        let (b, _) = generate_keypair();
        let reservation = ids.reserve().unwrap();
        let core = StreamCore::new(
            StreamId::new(reservation.id()),
            Addr::new(a, 49152),
            Addr::new(b, 80),
            frames,
            ids.clone(),
            None,
            close_timeout,
            tracing::Span::none(),
        );
        reservation.commit(Arc::clone(&core));
        Harness {
            stream: Stream::new(Arc::clone(&core)),
            core,
            ids,
            data_rx,
            ctrl_rx,
        }
    }

    #[tokio::test]
    async fn test_read_buffered_data_then_eof() {
        let mut h = harness(Duration::from_secs(1));
        h.core.on_data(Bytes::from_static(b"hello ")).unwrap();
        h.core.on_data(Bytes::from_static(b"world")).unwrap();
        h.core.on_close();

        let mut out = Vec::new();
        h.stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn test_reader_acks_half_window() {
        let mut h = harness(Duration::from_secs(1));
        let chunk = Bytes::from(vec![7u8; INITIAL_WINDOW / 2]);
        h.core.on_data(chunk).unwrap();

        let mut buf = vec![0u8; INITIAL_WINDOW / 2];
        h.stream.read_exact(&mut buf).await.unwrap();

        let ack = h.ctrl_rx.try_recv().unwrap();
        assert_eq!(ack.frame_type, FrameType::Ack);
        assert_eq!(ack.ack_credit().unwrap() as usize, INITIAL_WINDOW / 2);
    }

    #[tokio::test]
    async fn test_window_violation_is_rejected() {
        let h = harness(Duration::from_secs(1));
        h.core.on_data(Bytes::from(vec![0u8; INITIAL_WINDOW])).unwrap();
        assert!(h.core.on_data(Bytes::from_static(b"x")).is_err());
    }

    #[tokio::test]
    async fn test_write_chunks_and_consumes_credit() {
        let mut h = harness(Duration::from_secs(1));
        let payload = vec![1u8; MAX_DATA_CHUNK + 10];
        let n = h.stream.write(&payload).await.unwrap();
        assert_eq!(n, MAX_DATA_CHUNK);

        let frame = h.data_rx.recv().await.unwrap();
        assert_eq!(frame.frame_type, FrameType::Data);
        assert_eq!(frame.payload.len(), MAX_DATA_CHUNK);
        assert_eq!(h.core.write_state().credit, INITIAL_WINDOW - MAX_DATA_CHUNK);
    }

    #[tokio::test]
    async fn test_write_blocks_without_credit() {
        let mut h = harness(Duration::from_secs(1));
        h.core.write_state().credit = 0;

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), h.stream.write(b"data")).await;
        assert!(blocked.is_err());

        h.core.on_ack(2);
        let n = h.stream.write(b"data").await.unwrap();
        assert_eq!(n, 2);
    }

    #[tokio::test]
    async fn test_write_deadline() {
        let mut h = harness(Duration::from_secs(1));
        h.core.write_state().credit = 0;
        h.stream
            .set_write_deadline(Some(Instant::now() + Duration::from_millis(20)));
        let err = h.stream.write(b"data").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_read_deadline() {
        let mut h = harness(Duration::from_secs(1));
        h.stream
            .set_read_deadline(Some(Instant::now() + Duration::from_millis(20)));
        let mut buf = [0u8; 4];
        let err = h.stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_close_waits_for_peer_close() {
        let mut h = harness(Duration::from_secs(5));
        h.stream.close().await.unwrap();

        let frame = h.data_rx.recv().await.unwrap();
        assert_eq!(frame.frame_type, FrameType::Close);
        assert!(!h.core.is_released());
        assert_eq!(h.ids.len(), 1);

        h.core.on_close();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.core.is_released());
        assert!(h.ids.is_empty());
    }

    #[tokio::test]
    async fn test_close_timeout_reclaims_id() {
        let mut h = harness(Duration::from_millis(30));
        h.stream.close().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.core.is_released());
        assert!(h.ids.is_empty());
    }

    #[tokio::test]
    async fn test_session_closed_fails_io() {
        let mut h = harness(Duration::from_secs(1));
        let core = Arc::clone(&h.core);
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            h.stream.read(&mut buf).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        core.on_session_closed();

        let err = reader.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn test_shutdown_is_half_close() {
        let mut h = harness(Duration::from_secs(1));
        h.stream.shutdown().await.unwrap();
        let frame = h.data_rx.recv().await.unwrap();
        assert_eq!(frame.frame_type, FrameType::Close);

        assert!(h.stream.write(b"more").await.is_err());

        h.core.on_data(Bytes::from_static(b"reply")).unwrap();
        let mut buf = [0u8; 5];
        h.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");
    }
}
