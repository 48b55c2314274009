//! Reasoning streams: live relays of tokens, traces, rubric scores, or
//! verification transcripts between peers.
//!
//! The bus never interprets reasoning data. Inbound streams are
//! capability-checked on open and then forwarded, frame by frame, into
//! the node's reasoning sink; unknown frame kinds are skipped because
//! reasoning streams are extensible.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use bank_core::types::wire::{
    FrameKind, ReasoningChunkPayload, ReasoningKind, ReasoningOpenPayload,
};
use bank_core::types::Scope;

use crate::session::{HandlerRx, InboundEvent, SessionShared};

/// One event relayed off an inbound reasoning stream.
#[derive(Debug, Clone)]
pub enum ReasoningEvent {
    /// A peer opened a reasoning stream
    Opened {
        /// Session the stream belongs to
        session_id: u64,
        /// Stream id within the session
        stream_id: u32,
        /// Declared sub-kind
        sub_kind: ReasoningKind,
        /// Free-form label from the opener
        label: String,
    },
    /// One chunk of opaque reasoning data
    Chunk {
        /// Session the stream belongs to
        session_id: u64,
        /// Stream id within the session
        stream_id: u32,
        /// The relayed bytes
        data: Bytes,
    },
    /// The stream ended (explicitly or by abort)
    Ended {
        /// Session the stream belongs to
        session_id: u64,
        /// Stream id within the session
        stream_id: u32,
    },
}

/// Relay an inbound reasoning stream into the node's sink.
pub(crate) async fn relay_inbound(
    mut rx: HandlerRx,
    shared: Arc<SessionShared>,
    sink: Option<mpsc::Sender<ReasoningEvent>>,
) {
    let session_id = shared.session_id;
    let stream_id = rx.stream_id();

    // First frame must be the declaration
    let open = match rx.recv().await {
        Some(InboundEvent::Frame(frame)) if frame.kind == FrameKind::ReasoningOpen.code() => {
            match frame.decode::<ReasoningOpenPayload>() {
                Ok(open) => open,
                Err(e) => {
                    rx.abort(e.reason_code());
                    return;
                }
            }
        }
        _ => {
            rx.abort("protocol_error");
            return;
        }
    };

    if let Err(e) = shared.authorize(Scope::StreamReasoning) {
        warn!(reason = e.reason_code(), "reasoning stream refused");
        rx.abort(e.reason_code());
        return;
    }
    debug!(session_id, stream_id, sub_kind = ?open.sub_kind, "reasoning stream opened");

    emit(
        &sink,
        ReasoningEvent::Opened {
            session_id,
            stream_id,
            sub_kind: open.sub_kind,
            label: open.label,
        },
    )
    .await;

    while let Some(event) = rx.recv().await {
        let frame = match event {
            InboundEvent::Frame(frame) => frame,
            InboundEvent::Aborted(_) => break,
        };
        let end_of_stream = frame.is_end_of_stream();

        match FrameKind::from_code(frame.kind) {
            Some(FrameKind::ReasoningChunk) => match frame.decode::<ReasoningChunkPayload>() {
                Ok(chunk) => {
                    emit(
                        &sink,
                        ReasoningEvent::Chunk {
                            session_id,
                            stream_id,
                            data: Bytes::from(chunk.data),
                        },
                    )
                    .await;
                }
                Err(e) => {
                    rx.abort(e.reason_code());
                    break;
                }
            },
            Some(FrameKind::ReasoningEnd) => {
                rx.finished();
                emit(&sink, ReasoningEvent::Ended { session_id, stream_id }).await;
                return;
            }
            // Extensible stream: anything else is somebody's future
            // extension, not our problem
            _ => {}
        }
        if end_of_stream {
            break;
        }
    }

    rx.finished();
    emit(&sink, ReasoningEvent::Ended { session_id, stream_id }).await;
}

async fn emit(sink: &Option<mpsc::Sender<ReasoningEvent>>, event: ReasoningEvent) {
    if let Some(sink) = sink {
        // A full sink applies backpressure here, which in turn stops
        // granting credit to the peer
        let _ = sink.send(event).await;
    }
}
