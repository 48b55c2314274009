//! Periodic pattern-summary exchange with one connected peer.
//!
//! Every interval the task offers summaries of patterns committed since
//! its high-water mark on the session's outgoing pattern-sync stream. The
//! peer answers with `PatternRequested` for ids it does not hold, which
//! the inbound sync handler serves with `PatternFull`. Duplicate offers
//! are harmless: the receiver requests an id at most once per stream and
//! inserts idempotently.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::{debug, warn};

use bank_core::config::GossipConfig;
use bank_core::storage::PatternStore;
use bank_core::types::wire::{FrameKind, PatternOfferedPayload};

use crate::codec::Frame;
use crate::error::Result;
use crate::session::SessionHandle;

/// Run gossip toward one peer until the session closes.
pub(crate) async fn run(
    handle: SessionHandle,
    store: Arc<dyn PatternStore>,
    config: GossipConfig,
) {
    let period = Duration::from_secs(config.interval_secs.max(1));
    // First round fires after one full interval, leaving a joining peer
    // room to anti-entropy with a snapshot first
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First round offers everything; a joining peer typically shortcuts
    // this with a snapshot, after which the offers dedupe to nothing
    let mut high_water = DateTime::<Utc>::MIN_UTC;

    loop {
        interval.tick().await;
        if handle.is_closed() {
            return;
        }
        match round(&handle, &store, &config, high_water).await {
            Ok(Some(new_mark)) => high_water = new_mark,
            Ok(None) => {}
            Err(e) => {
                warn!(reason = e.reason_code(), "gossip round failed");
                if handle.is_closed() {
                    return;
                }
            }
        }
    }
}

/// One gossip round. Returns the new high-water mark when offers were
/// sent; the mark is the newest offered `created_at`, inclusive, so the
/// boundary pattern is re-offered once more next round, idempotently.
async fn round(
    handle: &SessionHandle,
    store: &Arc<dyn PatternStore>,
    config: &GossipConfig,
    high_water: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let mut fresh = store.iter_since(high_water).await?;
    let mut offers: Vec<PatternOfferedPayload> = Vec::new();
    while let Some(pattern) = fresh.next().await {
        let pattern = pattern?;
        offers.push(PatternOfferedPayload {
            id: pattern.id,
            context: pattern.context.clone(),
            strategy: pattern.strategy.clone(),
            created_at: pattern.created_at,
            content_hash: pattern.content_hash(),
        });
        if offers.len() >= config.max_pending_offers {
            debug!(cap = config.max_pending_offers, "gossip offer backlog capped");
            break;
        }
    }
    if offers.is_empty() {
        return Ok(None);
    }

    let out = handle.open_pattern_sync().await?;
    let mut newest = high_water;
    for batch in offers.chunks(config.batch_size.max(1)) {
        for offer in batch {
            newest = newest.max(offer.created_at);
            out.send(Frame::new(FrameKind::PatternOffered, offer)?).await?;
        }
        // Yield between batches so a large backlog cannot monopolize the
        // outgoing stream
        tokio::task::yield_now().await;
    }
    debug!(offers = offers.len(), "gossip round complete");
    Ok(Some(newest))
}
