//! Inbound pattern-sync stream handler.
//!
//! Processes `PatternOffered`, `PatternRequested`, and `PatternFull`
//! frames from the peer. Replies (requests for unknown ids, full patterns
//! the peer asked for) go out on this side's own pattern-sync stream,
//! obtained lazily from the session actor.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use bank_core::storage::PatternStore;
use bank_core::types::wire::{
    FrameKind, PatternFullPayload, PatternOfferedPayload, PatternRequestedPayload,
};
use bank_core::types::{PatternId, Scope};
use bank_core::Error;

use crate::codec::Frame;
use crate::error::{BusError, Result};
use crate::session::{HandlerRx, InboundEvent, InternalCmd, SessionShared, StreamSender};

/// Commit a pattern arriving from a peer: insert when new, attach the
/// outcome when we hold the bare pattern. Used by pattern-sync and by the
/// snapshot consumer.
pub(crate) async fn merge_remote_pattern(
    store: &Arc<dyn PatternStore>,
    payload: PatternFullPayload,
) -> Result<bool> {
    let pattern = payload.pattern;
    if !pattern.id_matches_content() {
        return Err(BusError::Core(Error::BadParameters(format!(
            "pattern {} does not hash to its id",
            pattern.id
        ))));
    }
    match store.get(pattern.id).await {
        Ok(existing) => {
            if existing.outcome.is_none() {
                if let Some(outcome) = pattern.outcome {
                    match store.attach_outcome(pattern.id, outcome).await {
                        Ok(()) | Err(Error::AlreadySet(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            Ok(false)
        }
        Err(Error::NotFound(_)) => match store.insert(pattern).await {
            Ok(_) => Ok(true),
            Err(Error::Duplicate(_)) => Ok(false),
            Err(e) => Err(e.into()),
        },
        Err(e) => Err(e.into()),
    }
}

struct SyncHandler {
    rx: HandlerRx,
    store: Arc<dyn PatternStore>,
    shared: Arc<SessionShared>,
    internal: tokio::sync::mpsc::UnboundedSender<InternalCmd>,
    /// Our outgoing pattern-sync stream, opened on first reply
    out: Option<StreamSender>,
    /// Ids we already asked for on this stream; duplicate offers are
    /// idempotent
    requested: HashSet<PatternId>,
}

impl SyncHandler {
    async fn reply_stream(&mut self) -> Result<StreamSender> {
        if let Some(out) = &self.out {
            return Ok(out.clone());
        }
        let (tx, rx) = oneshot::channel();
        self.internal
            .send(InternalCmd::OpenSyncStream { reply: tx })
            .map_err(|_| BusError::SessionClosed("session actor gone".to_string()))?;
        let sender = rx
            .await
            .map_err(|_| BusError::SessionClosed("session actor gone".to_string()))??;
        self.out = Some(sender.clone());
        Ok(sender)
    }

    async fn handle_offer(&mut self, frame: &Frame) -> Result<()> {
        self.shared.authorize(Scope::Gossip)?;
        let offer: PatternOfferedPayload = frame.decode()?;

        let already_known = store_has(&self.store, offer.id).await?;
        if already_known || self.requested.contains(&offer.id) {
            return Ok(());
        }
        self.requested.insert(offer.id);
        let out = self.reply_stream().await?;
        out.send(Frame::new(
            FrameKind::PatternRequested,
            &PatternRequestedPayload { id: offer.id },
        )?)
        .await
    }

    async fn handle_request(&mut self, frame: &Frame) -> Result<()> {
        self.shared.authorize(Scope::ReadPatterns)?;
        let request: PatternRequestedPayload = frame.decode()?;

        match self.store.get(request.id).await {
            Ok(pattern) => {
                let out = self.reply_stream().await?;
                out.send(Frame::new(
                    FrameKind::PatternFull,
                    &PatternFullPayload { pattern },
                )?)
                .await
            }
            Err(Error::NotFound(id)) => {
                debug!(%id, "peer requested a pattern we no longer offer");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn handle_full(&mut self, frame: &Frame) -> Result<()> {
        self.shared.authorize(Scope::WritePatterns)?;
        let payload: PatternFullPayload = frame.decode()?;
        let inserted = merge_remote_pattern(&self.store, payload).await?;
        if inserted {
            debug!("pattern received via sync");
        }
        Ok(())
    }

    async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            let frame = match event {
                InboundEvent::Frame(frame) => frame,
                InboundEvent::Aborted(reason) => {
                    debug!(%reason, "pattern-sync stream aborted");
                    return;
                }
            };
            let end_of_stream = frame.is_end_of_stream();

            let result = match FrameKind::from_code(frame.kind) {
                Some(FrameKind::PatternOffered) => self.handle_offer(&frame).await,
                Some(FrameKind::PatternRequested) => self.handle_request(&frame).await,
                Some(FrameKind::PatternFull) => self.handle_full(&frame).await,
                _ => Err(BusError::UnknownFrameKind(frame.kind)),
            };

            if let Err(e) = result {
                let recoverable = matches!(
                    &e,
                    BusError::Core(core) if matches!(
                        core,
                        Error::DimensionMismatch { .. }
                            | Error::BadParameters(_)
                            | Error::Duplicate(_)
                            | Error::AlreadySet(_)
                    )
                );
                if recoverable {
                    // Bad input from the peer spoils one frame, not the
                    // stream
                    warn!(reason = e.reason_code(), "pattern-sync frame rejected");
                    continue;
                }
                warn!(reason = e.reason_code(), "pattern-sync stream closing");
                self.rx.abort(e.reason_code());
                return;
            }
            if end_of_stream {
                break;
            }
        }
        self.rx.finished();
    }
}

async fn store_has(store: &Arc<dyn PatternStore>, id: PatternId) -> Result<bool> {
    match store.get(id).await {
        Ok(_) => Ok(true),
        Err(Error::NotFound(_)) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Entry point spawned by the session actor for each inbound pattern-sync
/// stream.
pub(crate) async fn run_inbound(
    rx: HandlerRx,
    store: Arc<dyn PatternStore>,
    shared: Arc<SessionShared>,
    internal: tokio::sync::mpsc::UnboundedSender<InternalCmd>,
) {
    SyncHandler {
        rx,
        store,
        shared,
        internal,
        out: None,
        requested: HashSet::new(),
    }
    .run()
    .await;
}
