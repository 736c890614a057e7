//! Relay side of a client session
//!
//! A stream between two clients is a [`Relay`] with one end on each
//! client's session. Frames arriving on one end are rewritten to the other
//! end's stream ID and forwarded. An end's table entry is dropped once CLOSE
//! has passed in both directions for it, or right away on REJECT.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use dashmap::DashMap;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use dmsg_core::ids::{IdManager, Parity};
use dmsg_core::DmsgError;
use dmsg_protocol::{DialRequest, Frame, FrameCodec, FrameType, ProtocolError, PubKey, StreamId};

use super::{spawn_writer, FrameSender};

/// Live client sessions by client key
pub(crate) type SessionMap = DashMap<PubKey, Arc<ServerSession>>;

/// Entry in a session's link table: the relay and which end this is
type Link = (Arc<Relay>, usize);

#[derive(Debug, Default, Clone, Copy)]
struct EndFlags {
    /// The end's client sent CLOSE
    recv_close: bool,
    /// The relay sent CLOSE to the end's client
    sent_close: bool,
    /// The end's session is gone or replaced the stream
    gone: bool,
}

struct End {
    session: Weak<ServerSession>,
    id: u16,
}

pub(crate) struct Relay {
    ends: [End; 2],
    flags: Mutex<[EndFlags; 2]>,
}

impl Relay {
    fn flags(&self) -> MutexGuard<'_, [EndFlags; 2]> {
        self.flags.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove_end(self: &Arc<Self>, side: usize) {
        let end = &self.ends[side];
        if let Some(session) = end.session.upgrade() {
            session
                .links
                .remove_if(end.id, |(relay, s)| Arc::ptr_eq(relay, self) && *s == side);
        }
    }

    fn reap(self: &Arc<Self>) {
        let flags = *self.flags();
        for (side, f) in flags.iter().enumerate() {
            if f.recv_close && f.sent_close {
                self.remove_end(side);
            }
        }
    }

    /// Pass a frame from end `from` to the other end
    async fn forward(self: &Arc<Self>, from: usize, frame: Frame) {
        let to = 1 - from;
        let frame_type = frame.frame_type;
        let peer = self.ends[to].session.upgrade();

        if frame_type == FrameType::Close {
            let send = {
                let mut f = self.flags();
                f[from].recv_close = true;
                let send = !f[to].sent_close && !f[to].gone;
                f[to].sent_close = true;
                send
            };
            if let (true, Some(peer)) = (send, peer) {
                let _ = peer
                    .frames
                    .send(frame.with_stream_id(StreamId::new(self.ends[to].id)))
                    .await;
            }
            self.reap();
            return;
        }

        let Some(peer) = peer.filter(|_| !self.flags()[to].gone) else {
            tracing::trace!(frame = ?frame_type, "Dropping frame for vanished stream end");
            return;
        };
        let frame = frame.with_stream_id(StreamId::new(self.ends[to].id));
        match frame_type {
            FrameType::Ack => {
                let _ = peer.frames.send_ctrl(frame);
            }
            FrameType::Reject => {
                let _ = peer.frames.send(frame).await;
                self.remove_end(0);
                self.remove_end(1);
            }
            _ => {
                let _ = peer.frames.send(frame).await;
            }
        }
    }

    /// Drop end `side`, closing the stream toward the other end
    fn abandon(self: &Arc<Self>, side: usize) {
        let to = 1 - side;
        let send = {
            let mut f = self.flags();
            f[side].gone = true;
            let send = !f[to].sent_close && !f[to].gone;
            f[to].sent_close = true;
            send
        };
        if send {
            if let Some(peer) = self.ends[to].session.upgrade() {
                peer.frames
                    .send_nowait(Frame::close(StreamId::new(self.ends[to].id)));
            }
        }
        self.remove_end(side);
        self.reap();
    }
}

/// Session between the relay and one client
pub(crate) struct ServerSession {
    client_pk: PubKey,
    frames: FrameSender,
    links: IdManager<Link>,
    closed: CancellationToken,
    span: tracing::Span,
}

impl ServerSession {
    /// Register a handshaken session and start serving it
    ///
    /// An existing session for the same client is closed and replaced.
    pub(crate) fn start<T>(
        client_pk: PubKey,
        framed: Framed<T, FrameCodec>,
        sessions: Arc<SessionMap>,
    ) -> Arc<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let span = tracing::debug_span!("session", client = %client_pk);
        let (sink, incoming) = framed.split();
        let closed = CancellationToken::new();
        let frames = spawn_writer(sink, closed.clone(), span.clone());

        let session = Arc::new(Self {
            client_pk,
            frames,
            links: IdManager::new(Parity::Odd),
            closed,
            span: span.clone(),
        });

        if let Some(old) = sessions.insert(client_pk, Arc::clone(&session)) {
            tracing::info!(parent: &span, "Client reconnected, replacing old session");
            old.close();
        }

        let reader = Arc::clone(&session);
        tokio::spawn(async move { reader.read_loop(incoming, sessions).await }.instrument(span));
        session
    }

    pub(crate) fn client_pk(&self) -> PubKey {
        self.client_pk
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn close(&self) {
        self.closed.cancel();
    }

    #[cfg(test)]
    pub(crate) fn link_count(&self) -> usize {
        self.links.len()
    }

    async fn read_loop<R>(self: Arc<Self>, mut incoming: R, sessions: Arc<SessionMap>)
    where
        R: futures::Stream<Item = Result<Frame, ProtocolError>> + Unpin,
    {
        let reason = loop {
            let frame = tokio::select! {
                _ = self.closed.cancelled() => break "closed by server".to_string(),
                next = incoming.next() => match next {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => break format!("read failed: {}", e),
                    None => break "connection closed by client".to_string(),
                },
            };

            if frame.frame_type == FrameType::Open {
                self.handle_open(frame, &sessions).await;
                continue;
            }
            match self.links.get(frame.stream_id.as_u16()) {
                Some((relay, side)) => relay.forward(side, frame).await,
                None => tracing::trace!(
                    stream = frame.stream_id.as_u16(),
                    frame = ?frame.frame_type,
                    "Frame for unknown stream"
                ),
            }
        };

        self.teardown(&reason);
        sessions.remove_if(&self.client_pk, |_, s| Arc::ptr_eq(s, &self));
    }

    fn validate_open(&self, payload: &[u8]) -> Result<DialRequest, DmsgError> {
        let req = DialRequest::decode(payload).map_err(|_| DmsgError::SignedObjectInvalid)?;
        if req.src.pk != self.client_pk {
            return Err(DmsgError::ReqInvalidSrcPk);
        }
        if req.src.port == 0 {
            return Err(DmsgError::ReqInvalidSrcPort);
        }
        if req.dst.port == 0 {
            return Err(DmsgError::ReqInvalidDstPort);
        }
        if req.dst.pk.is_null() {
            return Err(DmsgError::ReqInvalidDstPk);
        }
        req.verify().map_err(|_| DmsgError::ReqInvalidSig)?;
        Ok(req)
    }

    fn reject(&self, sid: StreamId, err: DmsgError) {
        tracing::debug!(stream = sid.as_u16(), error = %err, "Rejecting stream request");
        let _ = self.frames.send_ctrl(Frame::reject(sid, err.code()));
    }

    async fn handle_open(self: &Arc<Self>, frame: Frame, sessions: &SessionMap) {
        let sid = frame.stream_id;
        let id = sid.as_u16();

        if let Some((old, side)) = self.links.remove(id) {
            tracing::debug!(stream = id, "OPEN reuses a live stream id, dropping old stream");
            old.abandon(side);
        }

        let req = match self.validate_open(&frame.payload) {
            Ok(req) => req,
            Err(err) => return self.reject(sid, err),
        };

        let peer = sessions
            .get(&req.dst.pk)
            .map(|s| Arc::clone(s.value()))
            .filter(|s| !s.is_closed());
        let Some(peer) = peer else {
            return self.reject(sid, DmsgError::ReqNoNextSession);
        };
        let Some(reservation) = peer.links.reserve() else {
            return self.reject(sid, DmsgError::DialRespNotAccepted);
        };

        let relay = Arc::new(Relay {
            ends: [
                End {
                    session: Arc::downgrade(self),
                    id,
                },
                End {
                    session: Arc::downgrade(&peer),
                    id: reservation.id(),
                },
            ],
            flags: Mutex::new([EndFlags::default(); 2]),
        });
        if !self.links.insert_at(id, (Arc::clone(&relay), 0)) {
            return self.reject(sid, DmsgError::DialRespNotAccepted);
        }
        let peer_id = reservation.commit((Arc::clone(&relay), 1));

        tracing::debug!(
            stream = id,
            peer_stream = peer_id,
            src = %req.src,
            dst = %req.dst,
            "Relaying stream"
        );
        if peer
            .frames
            .send(frame.with_stream_id(StreamId::new(peer_id)))
            .await
            .is_err()
        {
            relay.remove_end(0);
            relay.remove_end(1);
            self.reject(sid, DmsgError::ReqNoNextSession);
        }
    }

    fn teardown(&self, reason: &str) {
        self.closed.cancel();
        let links = self.links.drain();
        for (_, (relay, side)) in &links {
            relay.abandon(*side);
        }
        tracing::info!(parent: &self.span, reason, streams = links.len(), "Client session closed");
    }
}
