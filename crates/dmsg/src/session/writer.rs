//! Session frame writer
//!
//! Every session has one writer task owning the sink. Two queues feed it:
//! the bounded data queue carries OPEN, DATA, CLOSE and relayed frames and
//! provides back-pressure; the unbounded control queue carries ACK, ACCEPT
//! and REJECT, which the read loop must be able to emit without blocking.
//! Control frames are written first whenever both queues have work.

use futures::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use dmsg_core::{DmsgError, Error};
use dmsg_protocol::{Frame, ProtocolError};

/// Capacity of the bounded data queue
pub(crate) const DATA_QUEUE_SIZE: usize = 64;

#[derive(Debug, Clone)]
pub(crate) struct FrameSender {
    data_tx: mpsc::Sender<Frame>,
    ctrl_tx: mpsc::UnboundedSender<Frame>,
}

impl FrameSender {
    /// Queue an ordered frame, waiting for room
    pub async fn send(&self, frame: Frame) -> Result<(), Error> {
        self.data_tx
            .send(frame)
            .await
            .map_err(|_| Error::Dmsg(DmsgError::SessionClosed))
    }

    /// Queue an ordered frame without waiting
    ///
    /// Falls back to a background send when the queue is full.
    pub fn send_nowait(&self, frame: Frame) {
        match self.data_tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let tx = self.data_tx.clone();
                    handle.spawn(async move {
                        let _ = tx.send(frame).await;
                    });
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Queue a control frame; never blocks
    pub fn send_ctrl(&self, frame: Frame) -> Result<(), Error> {
        self.ctrl_tx
            .send(frame)
            .map_err(|_| Error::Dmsg(DmsgError::SessionClosed))
    }

    /// Handle to the data queue for poll-based writers
    pub fn data_sender(&self) -> mpsc::Sender<Frame> {
        self.data_tx.clone()
    }
}

/// Spawn the writer task for `sink`
///
/// The task ends when `closed` fires or the sink fails; a sink failure
/// cancels `closed` so the rest of the session tears down too.
pub(crate) fn spawn_writer<S>(
    mut sink: S,
    closed: CancellationToken,
    span: tracing::Span,
) -> FrameSender
where
    S: Sink<Frame, Error = ProtocolError> + Unpin + Send + 'static,
{
    let (data_tx, mut data_rx) = mpsc::channel::<Frame>(DATA_QUEUE_SIZE);
    let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<Frame>();

    tokio::spawn(
        async move {
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = closed.cancelled() => break,
                    Some(frame) = ctrl_rx.recv() => frame,
                    Some(frame) = data_rx.recv() => frame,
                    else => break,
                };

                if let Err(e) = write_batch(&mut sink, frame, &mut ctrl_rx, &mut data_rx).await {
                    tracing::warn!(error = %e, "Session write failed");
                    closed.cancel();
                    break;
                }
            }
            let _ = sink.close().await;
            tracing::trace!("Session writer stopped");
        }
        .instrument(span),
    );

    FrameSender { data_tx, ctrl_tx }
}

/// Write `first` plus whatever is already queued, then flush once
async fn write_batch<S>(
    sink: &mut S,
    first: Frame,
    ctrl_rx: &mut mpsc::UnboundedReceiver<Frame>,
    data_rx: &mut mpsc::Receiver<Frame>,
) -> Result<(), ProtocolError>
where
    S: Sink<Frame, Error = ProtocolError> + Unpin,
{
    sink.feed(first).await?;
    for _ in 0..DATA_QUEUE_SIZE {
        let next = match ctrl_rx.try_recv() {
            Ok(frame) => frame,
            Err(_) => match data_rx.try_recv() {
                Ok(frame) => frame,
                Err(_) => break,
            },
        };
        sink.feed(next).await?;
    }
    sink.flush().await
}

/// Sender wired to bare queues, for exercising streams without a socket
#[cfg(test)]
pub(crate) fn test_frame_sender(
    capacity: usize,
) -> (
    FrameSender,
    mpsc::Receiver<Frame>,
    mpsc::UnboundedReceiver<Frame>,
) {
    let (data_tx, data_rx) = mpsc::channel(capacity);
    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
    (FrameSender { data_tx, ctrl_tx }, data_rx, ctrl_rx)
}
