//! Per-stream send and receive plumbing.
//!
//! Outbound frames pass through a [`StreamSender`], which parks on the
//! stream's credit semaphore when the peer has not granted room: senders
//! block, nothing is dropped. Inbound frames reach handler tasks through a
//! [`HandlerRx`], which returns one unit of credit to the peer for every
//! frame the handler actually consumes.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};

use crate::codec::Frame;
use crate::error::{BusError, Result};

use super::InternalCmd;

/// Route for outbound frames into the session actor's writer.
pub(crate) type OutboundTx = mpsc::Sender<(u32, Frame)>;

/// Handle for sending frames on one stream, gated by peer credit.
#[derive(Clone)]
pub struct StreamSender {
    stream_id: u32,
    credit: Arc<Semaphore>,
    out: OutboundTx,
}

impl StreamSender {
    pub(crate) fn new(stream_id: u32, credit: Arc<Semaphore>, out: OutboundTx) -> Self {
        Self {
            stream_id,
            credit,
            out,
        }
    }

    /// The stream this sender writes to.
    #[must_use]
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Send one frame, waiting for credit first.
    ///
    /// Blocks while the peer's credit is exhausted; fails once the stream
    /// or session has closed.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        let permit = self
            .credit
            .acquire()
            .await
            .map_err(|_| BusError::SessionClosed("stream closed".to_string()))?;
        permit.forget();
        self.out
            .send((self.stream_id, frame))
            .await
            .map_err(|_| BusError::SessionClosed("session writer gone".to_string()))
    }

    /// Credit currently available without blocking.
    #[must_use]
    pub fn available_credit(&self) -> usize {
        self.credit.available_permits()
    }

    /// Consume one credit unit without blocking; used by the session
    /// actor to write a stream's opening frame ahead of any queued data.
    pub(crate) fn try_reserve(&self) -> bool {
        match self.credit.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }
}

/// What a stream handler sees from its inbound channel.
#[derive(Debug)]
pub(crate) enum InboundEvent {
    /// A frame arrived on this stream
    Frame(Frame),
    /// The peer (or the session) aborted the stream
    Aborted(String),
}

/// Inbound side of one stream, owned by its handler task.
///
/// Consuming a frame grants one unit of credit back to the peer.
pub(crate) struct HandlerRx {
    stream_id: u32,
    rx: mpsc::Receiver<InboundEvent>,
    internal: mpsc::UnboundedSender<InternalCmd>,
}

impl HandlerRx {
    pub(crate) fn new(
        stream_id: u32,
        rx: mpsc::Receiver<InboundEvent>,
        internal: mpsc::UnboundedSender<InternalCmd>,
    ) -> Self {
        Self {
            stream_id,
            rx,
            internal,
        }
    }

    pub(crate) fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Next inbound event; `None` once the session has dropped the stream.
    pub(crate) async fn recv(&mut self) -> Option<InboundEvent> {
        let event = self.rx.recv().await;
        if matches!(event, Some(InboundEvent::Frame(_))) {
            let _ = self.internal.send(InternalCmd::GrantCredit {
                stream_id: self.stream_id,
                credits: 1,
            });
        }
        event
    }

    /// Ask the session to abort this stream, telling the peer `reason`.
    pub(crate) fn abort(&self, reason: &str) {
        let _ = self.internal.send(InternalCmd::AbortStream {
            stream_id: self.stream_id,
            reason: reason.to_string(),
            notify_peer: true,
        });
    }

    /// Tell the session this handler is done and the stream can be
    /// released.
    pub(crate) fn finished(&self) {
        let _ = self.internal.send(InternalCmd::StreamFinished {
            stream_id: self.stream_id,
        });
    }
}
