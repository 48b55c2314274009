//! Snapshot streams: bulk transfer of a store's contents to a joining
//! peer.
//!
//! The receiver opens the stream with `SnapshotRequest(since)`; the
//! serving side authorizes it (one spend unit), then walks `iter_since`
//! in commit order, packing patterns and the stats rows for their
//! contexts into self-describing chunks. The last chunk carries
//! `END_OF_STREAM`. Either side gives up when a chunk stalls past the
//! configured deadline.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use bank_core::storage::PatternStore;
use bank_core::types::wire::{
    FrameKind, SnapshotChunkPayload, SnapshotRequestPayload,
};
use bank_core::types::{Pattern, Scope, StrategyStats};

use crate::codec::Frame;
use crate::error::{BusError, Result};
use crate::session::{HandlerRx, InboundEvent, SessionShared, StreamSender};
use crate::sync::merge_remote_pattern;

/// Patterns packed into one snapshot chunk.
const CHUNK_PATTERNS: usize = 128;

/// Serve a snapshot stream opened by the peer. `rx` delivers the opening
/// `SnapshotRequest`; chunks flow back on `sender` under normal credit.
pub(crate) async fn serve(
    mut rx: HandlerRx,
    sender: StreamSender,
    store: Arc<dyn PatternStore>,
    shared: Arc<SessionShared>,
    chunk_timeout: Duration,
) {
    let request = match rx.recv().await {
        Some(InboundEvent::Frame(frame)) if frame.kind == FrameKind::SnapshotRequest.code() => {
            match frame.decode::<SnapshotRequestPayload>() {
                Ok(request) => request,
                Err(e) => {
                    warn!(reason = e.reason_code(), "malformed snapshot request");
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

    if let Err(e) = shared.authorize(Scope::RequestSnapshot) {
        warn!(reason = e.reason_code(), "snapshot request refused");
        rx.abort(e.reason_code());
        return;
    }

    if let Err(e) = stream_chunks(&sender, &store, request, chunk_timeout).await {
        warn!(reason = e.reason_code(), "snapshot serving failed");
        rx.abort(e.reason_code());
        return;
    }
    rx.finished();
}

async fn stream_chunks(
    sender: &StreamSender,
    store: &Arc<dyn PatternStore>,
    request: SnapshotRequestPayload,
    chunk_timeout: Duration,
) -> Result<()> {
    let mut patterns = store.iter_since(request.since).await?;
    let mut chunk: Vec<Pattern> = Vec::with_capacity(CHUNK_PATTERNS);
    let mut sent = 0u64;

    loop {
        match patterns.next().await {
            Some(pattern) => {
                chunk.push(pattern?);
                if chunk.len() == CHUNK_PATTERNS {
                    let payload = build_chunk(store, std::mem::take(&mut chunk)).await?;
                    sent += payload.patterns.len() as u64;
                    send_chunk(sender, payload, false, chunk_timeout).await?;
                }
            }
            None => {
                // Final chunk; empty is fine, the flag is what matters
                let payload = build_chunk(store, std::mem::take(&mut chunk)).await?;
                sent += payload.patterns.len() as u64;
                send_chunk(sender, payload, true, chunk_timeout).await?;
                info!(patterns = sent, "snapshot served");
                return Ok(());
            }
        }
    }
}

async fn build_chunk(
    store: &Arc<dyn PatternStore>,
    patterns: Vec<Pattern>,
) -> Result<SnapshotChunkPayload> {
    let contexts: BTreeSet<&str> = patterns.iter().map(|p| p.context.as_str()).collect();
    let mut stats: Vec<StrategyStats> = Vec::new();
    for context in contexts {
        stats.extend(store.strategy_stats(context).await?);
    }
    Ok(SnapshotChunkPayload { patterns, stats })
}

async fn send_chunk(
    sender: &StreamSender,
    payload: SnapshotChunkPayload,
    last: bool,
    chunk_timeout: Duration,
) -> Result<()> {
    let frame = if last {
        Frame::final_frame(FrameKind::SnapshotChunk, &payload)?
    } else {
        Frame::new(FrameKind::SnapshotChunk, &payload)?
    };
    tokio::time::timeout(chunk_timeout, sender.send(frame))
        .await
        .map_err(|_| BusError::SessionClosed("snapshot chunk stalled".to_string()))?
}

/// Consume a snapshot we requested: send the request, merge every chunk
/// into the local store, resolve `done` with the pattern count once the
/// final chunk lands.
pub(crate) async fn consume(
    mut rx: HandlerRx,
    sender: StreamSender,
    request: Frame,
    store: Arc<dyn PatternStore>,
    chunk_timeout: Duration,
    done: oneshot::Sender<Result<u64>>,
) {
    let result = consume_inner(&mut rx, sender, request, &store, chunk_timeout).await;
    match &result {
        Ok(count) => {
            debug!(patterns = count, "snapshot consumed");
            rx.finished();
        }
        Err(e) => rx.abort(e.reason_code()),
    }
    let _ = done.send(result);
}

async fn consume_inner(
    rx: &mut HandlerRx,
    sender: StreamSender,
    request: Frame,
    store: &Arc<dyn PatternStore>,
    chunk_timeout: Duration,
) -> Result<u64> {
    sender.send(request).await?;

    let mut received = 0u64;
    loop {
        let event = tokio::time::timeout(chunk_timeout, rx.recv())
            .await
            .map_err(|_| BusError::SessionClosed("snapshot chunk stalled".to_string()))?;
        let frame = match event {
            Some(InboundEvent::Frame(frame)) => frame,
            Some(InboundEvent::Aborted(reason)) => {
                return Err(BusError::StreamAborted(reason));
            }
            None => {
                return Err(BusError::SessionClosed(
                    "session closed during snapshot".to_string(),
                ));
            }
        };
        if frame.kind != FrameKind::SnapshotChunk.code() {
            return Err(BusError::UnknownFrameKind(frame.kind));
        }
        let end_of_stream = frame.is_end_of_stream();
        let chunk: SnapshotChunkPayload = frame.decode()?;
        for pattern in chunk.patterns {
            if merge_remote_pattern(
                store,
                bank_core::types::wire::PatternFullPayload { pattern },
            )
            .await?
            {
                received += 1;
            }
        }
        if end_of_stream {
            return Ok(received);
        }
    }
}
