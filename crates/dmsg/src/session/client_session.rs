//! Client side of a session with one relay server

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use dmsg_core::config::ClientConfig;
use dmsg_core::ids::{IdManager, Parity, Reservation};
use dmsg_core::netutil::Porter;
use dmsg_core::time::{skew_from_now, unix_nanos};
use dmsg_core::{DmsgError, Error, Result};
use dmsg_protocol::{
    Addr, DialRequest, DialResponse, Frame, FrameType, ProtocolError, PubKey, SecKey, StreamId,
};

use super::{client_handshake, spawn_writer, FrameSender};
use crate::listener::ListenerHandle;
use crate::stream::{Stream, StreamCore};

/// Largest accepted distance between a request timestamp and local time
pub(crate) const MAX_TIMESTAMP_SKEW: Duration = Duration::from_secs(30);

/// Prune the replay table once it tracks this many sources
const TIMESTAMP_PRUNE_THRESHOLD: usize = 1024;

/// What a reserved local port is used for
#[derive(Debug, Clone)]
pub(crate) enum PortUse {
    Listener(ListenerHandle),
    Stream,
}

/// Rejects stale and replayed stream requests
///
/// Each source must present timestamps within [`MAX_TIMESTAMP_SKEW`] of now
/// and strictly greater than the last one accepted from it.
#[derive(Debug, Default)]
pub(crate) struct TimestampTracker {
    last: Mutex<HashMap<PubKey, u64>>,
}

impl TimestampTracker {
    pub(crate) fn check(&self, src: &PubKey, timestamp: u64) -> std::result::Result<(), DmsgError> {
        if skew_from_now(timestamp) > MAX_TIMESTAMP_SKEW {
            return Err(DmsgError::ReqInvalidTimestamp);
        }
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(prev) = last.get(src) {
            if timestamp <= *prev {
                return Err(DmsgError::ReqInvalidTimestamp);
            }
        }
        last.insert(*src, timestamp);

        if last.len() > TIMESTAMP_PRUNE_THRESHOLD {
            // Anything this old fails the skew check anyway.
            let horizon = unix_nanos().saturating_sub(MAX_TIMESTAMP_SKEW.as_nanos() as u64);
            last.retain(|_, ts| *ts >= horizon);
        }
        Ok(())
    }
}

/// State shared by a client and all of its sessions
pub(crate) struct ClientShared {
    pub(crate) pk: PubKey,
    pub(crate) sk: SecKey,
    pub(crate) config: ClientConfig,
    pub(crate) porter: Porter<PortUse>,
    last_timestamp: AtomicU64,
}

impl ClientShared {
    pub(crate) fn new(pk: PubKey, sk: SecKey, config: ClientConfig) -> Self {
        Self {
            pk,
            sk,
            config,
            porter: Porter::new(),
            last_timestamp: AtomicU64::new(0),
        }
    }

    /// Wall-clock nanoseconds, bumped so no two requests share a timestamp
    fn next_timestamp(&self) -> u64 {
        let now = unix_nanos();
        let prev = self
            .last_timestamp
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(prev + 1)
    }
}

/// A dial waiting for the remote ACCEPT or REJECT
struct PendingDial {
    req: DialRequest,
    core: Arc<StreamCore>,
    reservation: Reservation<Arc<StreamCore>>,
    tx: oneshot::Sender<std::result::Result<Stream, DmsgError>>,
}

/// Drops a dial's pending entry when the dial future goes away early
///
/// Matching on the stream core keeps a recycled ID owned by a newer dial
/// untouched.
struct PendingGuard<'a> {
    session: &'a ClientSession,
    id: u16,
    core: Arc<StreamCore>,
}

impl PendingGuard<'_> {
    /// Withdraw the dial; false when the read loop already settled it
    fn cancel(&self) -> bool {
        let removed = self
            .session
            .pending
            .remove_if(&self.id, |_, p| Arc::ptr_eq(&p.core, &self.core));
        if removed.is_none() {
            return false;
        }
        self.session
            .frames
            .send_nowait(Frame::close(StreamId::new(self.id)));
        true
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.cancel() {
            tracing::debug!(parent: &self.session.span, stream = self.id, "Dial abandoned");
        }
    }
}

/// An authenticated session with one relay server
pub(crate) struct ClientSession {
    server_pk: PubKey,
    server_addr: String,
    shared: Arc<ClientShared>,
    frames: FrameSender,
    streams: IdManager<Arc<StreamCore>>,
    pending: DashMap<u16, PendingDial>,
    /// Held from timestamp selection until the OPEN is queued
    open_lock: tokio::sync::Mutex<()>,
    timestamps: TimestampTracker,
    closed: CancellationToken,
    reason: Mutex<Option<String>>,
    span: tracing::Span,
}

impl ClientSession {
    /// Handshake with the server over `io` and start the session tasks
    pub(crate) async fn establish<T>(
        io: T,
        server_pk: PubKey,
        server_addr: String,
        shared: Arc<ClientShared>,
    ) -> Result<Arc<Self>>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let span = tracing::debug_span!("session", server = %server_pk, addr = %server_addr);
        let framed = tokio::time::timeout(
            shared.config.handshake_timeout,
            client_handshake(io, shared.pk, &shared.sk, server_pk),
        )
        .await
        .map_err(|_| Error::Timeout("session handshake"))??;

        let (sink, incoming) = framed.split();
        let closed = CancellationToken::new();
        let frames = spawn_writer(sink, closed.clone(), span.clone());

        let session = Self::new(server_pk, server_addr, shared, frames, closed, span.clone());

        let reader = Arc::clone(&session);
        tokio::spawn(async move { reader.read_loop(incoming).await }.instrument(span));

        tracing::info!(parent: &session.span, "Session established");
        Ok(session)
    }

    fn new(
        server_pk: PubKey,
        server_addr: String,
        shared: Arc<ClientShared>,
        frames: FrameSender,
        closed: CancellationToken,
        span: tracing::Span,
    ) -> Arc<Self> {
        Arc::new(Self {
            server_pk,
            server_addr,
            shared,
            frames,
            streams: IdManager::new(Parity::Even),
            pending: DashMap::new(),
            open_lock: tokio::sync::Mutex::new(()),
            timestamps: TimestampTracker::default(),
            closed,
            reason: Mutex::new(None),
            span,
        })
    }

    pub(crate) fn server_pk(&self) -> PubKey {
        self.server_pk
    }

    pub(crate) fn server_addr(&self) -> &str {
        &self.server_addr
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the session has torn down
    pub(crate) async fn wait_closed(&self) {
        self.closed.cancelled().await
    }

    /// Why the session ended, once it has
    pub(crate) fn close_reason(&self) -> Option<String> {
        self.reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub(crate) fn close(&self) {
        self.closed.cancel();
    }

    /// Open a stream to `dst` through this session's server
    pub(crate) async fn dial(&self, dst: Addr) -> Result<Stream> {
        if self.is_closed() {
            return Err(DmsgError::SessionClosed.into());
        }
        let (port, guard) = self
            .shared
            .porter
            .reserve_ephemeral(PortUse::Stream)
            .ok_or(DmsgError::PortOccupied)?;
        let reservation = self
            .streams
            .reserve()
            .ok_or_else(|| Error::Io(io::Error::other("no free stream ids on session")))?;

        let id = reservation.id();
        let sid = StreamId::new(id);
        let local = Addr::new(self.shared.pk, port);
        let core = StreamCore::new(
            sid,
            local,
            dst,
            self.frames.clone(),
            self.streams.clone(),
            Some(guard),
            self.shared.config.close_timeout,
            tracing::debug_span!(parent: &self.span, "stream", id, remote = %dst),
        );

        let (tx, mut rx) = oneshot::channel();
        let pending = PendingGuard {
            session: self,
            id,
            core: Arc::clone(&core),
        };
        {
            // The responder rejects a timestamp at or below the last one it saw
            // from us, so OPENs must reach the queue in timestamp order.
            let _order = self.open_lock.lock().await;
            let req = DialRequest::signed(local, dst, self.shared.next_timestamp(), &self.shared.sk);
            let open = Frame::open(sid, &req);
            self.pending.insert(
                id,
                PendingDial {
                    req,
                    core,
                    reservation,
                    tx,
                },
            );
            self.frames.send(open).await?;
        }
        tracing::debug!(parent: &self.span, stream = id, dst = %dst, "Dialing stream");

        let outcome = match tokio::time::timeout(self.shared.config.dial_timeout, &mut rx).await {
            Ok(outcome) => outcome,
            Err(_) => {
                if pending.cancel() {
                    return Err(Error::Timeout("stream dial"));
                }
                // The read loop already took the dial; its answer is on the way.
                rx.await
            }
        };

        match outcome {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(DmsgError::SessionClosed.into()),
        }
    }

    async fn read_loop<R>(self: Arc<Self>, mut incoming: R)
    where
        R: futures::Stream<Item = std::result::Result<Frame, ProtocolError>> + Unpin,
    {
        let reason = loop {
            let frame = tokio::select! {
                _ = self.closed.cancelled() => break "closed locally".to_string(),
                next = incoming.next() => match next {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => break format!("read failed: {}", e),
                    None => break "connection closed by server".to_string(),
                },
            };
            self.handle_frame(frame);
        };
        self.teardown(reason);
    }

    fn handle_frame(&self, frame: Frame) {
        let sid = frame.stream_id;
        let id = sid.as_u16();
        match frame.frame_type {
            FrameType::Open => {
                if let Err(err) = self.accept_open(sid, &frame.payload) {
                    tracing::debug!(stream = id, error = %err, "Rejecting inbound stream");
                    let _ = self.frames.send_ctrl(Frame::reject(sid, err.code()));
                }
            }
            FrameType::Accept => self.handle_accept(sid, &frame.payload),
            FrameType::Reject => {
                if let Some((_, pending)) = self.pending.remove(&id) {
                    let code = frame
                        .reject_code()
                        .unwrap_or(DmsgError::DialRespNotAccepted.code());
                    let _ = pending.tx.send(Err(DmsgError::from_reject_code(code)));
                }
            }
            FrameType::Data => match self.streams.get(id) {
                Some(core) => {
                    if core.on_data(frame.payload).is_err() {
                        core.reset();
                    }
                }
                None => tracing::trace!(stream = id, "DATA for unknown stream"),
            },
            FrameType::Ack => {
                if let (Some(core), Ok(credit)) = (self.streams.get(id), frame.ack_credit()) {
                    core.on_ack(credit);
                }
            }
            FrameType::Close => {
                if let Some((_, pending)) = self.pending.remove(&id) {
                    let _ = self.frames.send_ctrl(Frame::close(sid));
                    let _ = pending.tx.send(Err(DmsgError::DialRespNotAccepted));
                } else if let Some(core) = self.streams.get(id) {
                    core.on_close();
                }
            }
        }
    }

    /// Validate an inbound OPEN and hand the stream to its listener
    fn accept_open(&self, sid: StreamId, payload: &[u8]) -> std::result::Result<(), DmsgError> {
        let req = DialRequest::decode(payload).map_err(|_| DmsgError::SignedObjectInvalid)?;
        if req.dst.pk != self.shared.pk {
            return Err(DmsgError::ReqInvalidDstPk);
        }
        if req.src.port == 0 {
            return Err(DmsgError::ReqInvalidSrcPort);
        }
        if req.dst.port == 0 {
            return Err(DmsgError::ReqInvalidDstPort);
        }
        if req.src.pk.is_null() {
            return Err(DmsgError::ReqInvalidSrcPk);
        }
        req.verify().map_err(|_| DmsgError::ReqInvalidSig)?;
        self.timestamps.check(&req.src.pk, req.timestamp)?;

        let listener = match self.shared.porter.port_value(req.dst.port) {
            Some(PortUse::Listener(listener)) => listener,
            _ => return Err(DmsgError::ReqNoListener),
        };
        let permit = listener.try_reserve()?;

        let core = StreamCore::new(
            sid,
            req.dst,
            req.src,
            self.frames.clone(),
            self.streams.clone(),
            None,
            self.shared.config.close_timeout,
            tracing::debug_span!(parent: &self.span, "stream", id = sid.as_u16(), remote = %req.src),
        );
        if !self.streams.insert_at(sid.as_u16(), Arc::clone(&core)) {
            return Err(DmsgError::DialRespNotAccepted);
        }

        let resp = DialResponse::accept(&req, &self.shared.sk);
        if self.frames.send_ctrl(Frame::accept(sid, &resp)).is_err() {
            self.streams.remove(sid.as_u16());
            return Err(DmsgError::SessionClosed);
        }
        tracing::debug!(stream = sid.as_u16(), src = %req.src, port = req.dst.port, "Accepted inbound stream");
        permit.send(Stream::new(core));
        Ok(())
    }

    fn handle_accept(&self, sid: StreamId, payload: &[u8]) {
        let Some((_, pending)) = self.pending.remove(&sid.as_u16()) else {
            tracing::trace!(stream = sid.as_u16(), "ACCEPT for unknown dial");
            let _ = self.frames.send_ctrl(Frame::close(sid));
            return;
        };

        let checked = DialResponse::decode(payload)
            .map_err(|_| DmsgError::SignedObjectInvalid)
            .and_then(|resp| {
                if !resp.matches(&pending.req) {
                    Err(DmsgError::DialRespInvalidHash)
                } else if resp.verify(&pending.req.dst.pk).is_err() {
                    Err(DmsgError::DialRespInvalidSig)
                } else {
                    Ok(())
                }
            });

        match checked {
            Ok(()) => {
                // Commit here so DATA right behind the ACCEPT finds the stream.
                pending.reservation.commit(Arc::clone(&pending.core));
                // A dial that has gone away drops the stream, closing it.
                let _ = pending.tx.send(Ok(Stream::new(pending.core)));
            }
            Err(err) => {
                tracing::warn!(stream = sid.as_u16(), error = %err, "Invalid ACCEPT");
                let _ = self.frames.send_ctrl(Frame::close(sid));
                let _ = pending.tx.send(Err(err));
            }
        }
    }

    fn teardown(&self, reason: String) {
        *self.reason.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason.clone());
        self.closed.cancel();

        let streams = self.streams.drain();
        for (_, core) in &streams {
            core.on_session_closed();
        }
        // Dropping the senders fails every pending dial with SessionClosed.
        self.pending.clear();
        tracing::info!(parent: &self.span, reason = %reason, streams = streams.len(), "Session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_frame_sender;
    use dmsg_protocol::cipher::generate_keypair;
    use tokio::sync::mpsc;

    fn seconds(n: u64) -> u64 {
        Duration::from_secs(n).as_nanos() as u64
    }

    #[test]
    fn test_tracker_accepts_increasing_timestamps() {
        let tracker = TimestampTracker::default();
        let (src, _) = generate_keypair();
        let now = unix_nanos();

        assert!(tracker.check(&src, now).is_ok());
        assert!(tracker.check(&src, now + 1).is_ok());
        assert!(tracker.check(&src, now + 1_000).is_ok());
    }

    #[test]
    fn test_tracker_rejects_replayed_and_older_timestamps() {
        let tracker = TimestampTracker::default();
        let (src, _) = generate_keypair();
        let now = unix_nanos();

        tracker.check(&src, now).unwrap();
        assert_eq!(tracker.check(&src, now), Err(DmsgError::ReqInvalidTimestamp));
        assert_eq!(tracker.check(&src, now - 1), Err(DmsgError::ReqInvalidTimestamp));
        // A rejected timestamp does not move the high-water mark.
        assert!(tracker.check(&src, now + 1).is_ok());
    }

    #[test]
    fn test_tracker_sources_are_independent() {
        let tracker = TimestampTracker::default();
        let (a, _) = generate_keypair();
        let (b, _) = generate_keypair();
        let now = unix_nanos();

        tracker.check(&a, now + 10).unwrap();
        assert!(tracker.check(&b, now).is_ok());
    }

    #[test]
    fn test_tracker_rejects_skewed_timestamps() {
        let tracker = TimestampTracker::default();
        let (src, _) = generate_keypair();
        let now = unix_nanos();

        assert_eq!(
            tracker.check(&src, now - seconds(31)),
            Err(DmsgError::ReqInvalidTimestamp)
        );
        assert_eq!(
            tracker.check(&src, now + seconds(31)),
            Err(DmsgError::ReqInvalidTimestamp)
        );
        // Skewed requests leave no trace, so an in-window one still passes.
        assert!(tracker.check(&src, now).is_ok());
    }

    #[test]
    fn test_tracker_prunes_stale_sources() {
        let tracker = TimestampTracker::default();
        let stale = unix_nanos() - seconds(60);
        {
            let mut last = tracker.last.lock().unwrap();
            for _ in 0..TIMESTAMP_PRUNE_THRESHOLD {
                last.insert(generate_keypair().0, stale);
            }
        }
        let (fresh, _) = generate_keypair();
        tracker.check(&fresh, unix_nanos()).unwrap();

        let last = tracker.last.lock().unwrap();
        assert_eq!(last.len(), 1);
        assert!(last.contains_key(&fresh));
    }

    #[test]
    fn test_tracker_keeps_live_sources_when_pruning() {
        let tracker = TimestampTracker::default();
        let recent = unix_nanos() - seconds(5);
        {
            let mut last = tracker.last.lock().unwrap();
            for _ in 0..TIMESTAMP_PRUNE_THRESHOLD {
                last.insert(generate_keypair().0, recent);
            }
        }
        tracker.check(&generate_keypair().0, unix_nanos()).unwrap();
        assert_eq!(
            tracker.last.lock().unwrap().len(),
            TIMESTAMP_PRUNE_THRESHOLD + 1
        );
    }

    #[test]
    fn test_client_timestamps_strictly_increase() {
        let (pk, sk) = generate_keypair();
        let shared = ClientShared::new(pk, sk, ClientConfig::default());
        let mut prev = 0;
        for _ in 0..1000 {
            let ts = shared.next_timestamp();
            assert!(ts > prev);
            prev = ts;
        }
    }

    struct Harness {
        session: Arc<ClientSession>,
        sk: SecKey,
        data_rx: mpsc::Receiver<Frame>,
        ctrl_rx: mpsc::UnboundedReceiver<Frame>,
    }

    fn harness(config: ClientConfig) -> Harness {
        let (pk, sk) = generate_keypair();
        let (server, _) = generate_keypair();
        let (frames, data_rx, ctrl_rx) = test_frame_sender(256);
        let shared = Arc::new(ClientShared::new(pk, sk.clone(), config));
        let session = ClientSession::new(
            server,
            "test".to_string(),
            shared,
            frames,
            CancellationToken::new(),
            tracing::Span::none(),
        );
        Harness {
            session,
            sk,
            data_rx,
            ctrl_rx,
        }
    }

    fn spawn_dial(
        session: &Arc<ClientSession>,
        dst: Addr,
    ) -> tokio::task::JoinHandle<Result<Stream>> {
        let session = Arc::clone(session);
        tokio::spawn(async move { session.dial(dst).await })
    }

    async fn next_open(h: &mut Harness) -> (StreamId, DialRequest) {
        let frame = h.data_rx.recv().await.unwrap();
        assert_eq!(frame.frame_type, FrameType::Open);
        (frame.stream_id, DialRequest::decode(&frame.payload).unwrap())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_dials_queue_opens_in_timestamp_order() {
        let mut h = harness(ClientConfig::default());
        let (dst, _) = generate_keypair();

        let dials: Vec<_> = (0..100)
            .map(|_| spawn_dial(&h.session, Addr::new(dst, 80)))
            .collect();

        let mut prev = 0;
        for _ in 0..dials.len() {
            let (_, req) = next_open(&mut h).await;
            assert!(req.timestamp > prev, "OPEN queued out of timestamp order");
            prev = req.timestamp;
        }
        h.session.close();
    }

    #[tokio::test]
    async fn test_accept_signed_by_wrong_key_fails_dial() {
        let mut h = harness(ClientConfig::default());
        let (dst, _) = generate_keypair();
        let (_, imposter) = generate_keypair();

        let dial = spawn_dial(&h.session, Addr::new(dst, 80));
        let (sid, req) = next_open(&mut h).await;
        h.session
            .handle_frame(Frame::accept(sid, &DialResponse::accept(&req, &imposter)));

        let err = dial.await.unwrap().unwrap_err();
        assert_eq!(err.dmsg(), Some(DmsgError::DialRespInvalidSig));
        assert_eq!(err.dmsg().unwrap().code(), 350);

        let close = h.ctrl_rx.try_recv().unwrap();
        assert_eq!((close.frame_type, close.stream_id), (FrameType::Close, sid));
        assert_eq!(h.session.stream_count(), 0);
    }

    #[tokio::test]
    async fn test_accept_for_another_request_fails_dial() {
        let mut h = harness(ClientConfig::default());
        let (dst, dst_sk) = generate_keypair();

        let dial = spawn_dial(&h.session, Addr::new(dst, 80));
        let (sid, req) = next_open(&mut h).await;
        let other = DialRequest::signed(req.src, req.dst, req.timestamp + 1, &h.sk);
        h.session
            .handle_frame(Frame::accept(sid, &DialResponse::accept(&other, &dst_sk)));

        let err = dial.await.unwrap().unwrap_err();
        assert_eq!(err.dmsg(), Some(DmsgError::DialRespInvalidHash));
        assert_eq!(err.dmsg().unwrap().code(), 351);
        assert_eq!(h.session.stream_count(), 0);
    }

    #[tokio::test]
    async fn test_genuine_accept_completes_dial() {
        let mut h = harness(ClientConfig::default());
        let (dst, dst_sk) = generate_keypair();

        let dial = spawn_dial(&h.session, Addr::new(dst, 80));
        let (sid, req) = next_open(&mut h).await;
        h.session
            .handle_frame(Frame::accept(sid, &DialResponse::accept(&req, &dst_sk)));

        let stream = dial.await.unwrap().unwrap();
        assert_eq!(stream.stream_id(), sid);
        assert_eq!(stream.remote_addr(), Addr::new(dst, 80));
        assert_eq!(h.session.stream_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_dial_frees_id_and_port() {
        let mut h = harness(ClientConfig::default());
        let (dst, _) = generate_keypair();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), h.session.dial(Addr::new(dst, 80)))
                .await;
        assert!(abandoned.is_err());

        let (sid, _) = next_open(&mut h).await;
        let close = h.data_rx.recv().await.unwrap();
        assert_eq!((close.frame_type, close.stream_id), (FrameType::Close, sid));
        assert!(h.session.pending.is_empty());
        assert_eq!(h.session.stream_count(), 0);
        assert!(h.session.shared.porter.is_empty());
    }

    #[tokio::test]
    async fn test_dial_timeout_frees_id_and_port() {
        let mut h = harness(ClientConfig {
            dial_timeout: Duration::from_millis(50),
            ..ClientConfig::default()
        });
        let (dst, _) = generate_keypair();

        let err = h.session.dial(Addr::new(dst, 80)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(err.is_temporary());

        let (sid, _) = next_open(&mut h).await;
        let close = h.data_rx.recv().await.unwrap();
        assert_eq!((close.frame_type, close.stream_id), (FrameType::Close, sid));
        assert!(h.session.pending.is_empty());
        assert!(h.session.shared.porter.is_empty());
    }

    #[tokio::test]
    async fn test_reject_maps_code_and_frees_id() {
        let mut h = harness(ClientConfig::default());
        let (dst, _) = generate_keypair();

        let dial = spawn_dial(&h.session, Addr::new(dst, 80));
        let (sid, _) = next_open(&mut h).await;
        h.session
            .handle_frame(Frame::reject(sid, DmsgError::AcceptChanMaxed.code()));

        let err = dial.await.unwrap().unwrap_err();
        assert_eq!(err.dmsg(), Some(DmsgError::AcceptChanMaxed));
        assert!(err.is_temporary());
        assert_eq!(h.session.stream_count(), 0);
        assert!(h.session.shared.porter.is_empty());
    }

    #[tokio::test]
    async fn test_replayed_open_is_rejected_per_session() {
        let h = harness(ClientConfig::default());
        let other = harness(ClientConfig::default());
        let (src, src_sk) = generate_keypair();
        let dst = Addr::new(h.session.shared.pk, 80);
        let req = DialRequest::signed(Addr::new(src, 49152), dst, unix_nanos(), &src_sk);

        // No listener, so the first OPEN passes the replay check and stops there.
        assert_eq!(
            h.session.accept_open(StreamId::new(1), &req.encode()),
            Err(DmsgError::ReqNoListener)
        );
        assert_eq!(
            h.session.accept_open(StreamId::new(3), &req.encode()),
            Err(DmsgError::ReqInvalidTimestamp)
        );
        // Another session keeps its own history for the same source.
        assert!(other.session.timestamps.check(&src, req.timestamp).is_ok());
    }
}
