//! `PatternStore` implementation over the redb tables.
//!
//! Writers serialize behind one async mutex and commit inside
//! `spawn_blocking`; the in-memory index is updated in the same blocking
//! task immediately after the durable commit, so a cancelled caller
//! either sees no effect or finds the commit on retry.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};

use bank_core::similarity::similarity;
use bank_core::storage::{rank_results, PatternStore, QueryFilter, ScoredPattern};
use bank_core::types::{Outcome, Pattern, PatternId, StrategyStats};
use bank_core::{Error, Result};

use crate::{
    with_db_timeout, LogOp, RedbPatternStore, LOG_TABLE, META_EMBEDDING_DIM, META_TABLE,
    PATTERNS_TABLE, STATS_TABLE,
};

impl RedbPatternStore {
    fn refuse_if_read_only(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(Error::Corrupt(
                "store is in read-only mode after detected corruption".to_string(),
            ));
        }
        Ok(())
    }

    /// Fold `outcome` into the stats row for `(context, strategy)`,
    /// returning the updated row without touching shared state.
    fn next_stats_row(&self, context: &str, strategy: &str, outcome: &Outcome) -> StrategyStats {
        let index = self.index.read();
        match index.stats.get(&(context.to_string(), strategy.to_string())) {
            Some(existing) => {
                let mut row = existing.clone();
                row.observe(outcome);
                row
            }
            None => StrategyStats::first(context, strategy, outcome),
        }
    }
}

#[async_trait]
impl PatternStore for RedbPatternStore {
    async fn insert(&self, pattern: Pattern) -> Result<PatternId> {
        self.refuse_if_read_only()?;
        if !pattern.id_matches_content() {
            return Err(Error::BadParameters(format!(
                "pattern id {} does not match its content",
                pattern.id
            )));
        }

        let _writer = self.write_lock.lock().await;

        let persist_dim;
        {
            let index = self.index.read();
            let expected = index.dim.unwrap_or(pattern.embedding.len());
            if pattern.embedding.len() != expected {
                return Err(Error::DimensionMismatch {
                    expected,
                    actual: pattern.embedding.len(),
                });
            }
            if let Some(existing) = index.patterns.get(&pattern.id) {
                if existing.same_content(&pattern) {
                    return Ok(pattern.id);
                }
                return Err(Error::Duplicate(pattern.id));
            }
            persist_dim = index.dim.is_none().then_some(expected);
        }

        let mut pattern = pattern;
        pattern.outcome = pattern.outcome.take().map(|o| o.normalized());
        let stats_row = pattern
            .outcome
            .as_ref()
            .map(|o| self.next_stats_row(&pattern.context, &pattern.strategy, o));

        let db = Arc::clone(&self.db);
        let index = Arc::clone(&self.index);
        let id = pattern.id;

        with_db_timeout(move || {
            let row = postcard::to_allocvec(&pattern)
                .map_err(|e| Error::StorageUnavailable(format!("row encoding failed: {e}")))?;
            let log_entry = postcard::to_allocvec(&LogOp::Insert(id))
                .map_err(|e| Error::StorageUnavailable(format!("log encoding failed: {e}")))?;
            let stats_bytes = match &stats_row {
                Some(stats) => Some(postcard::to_allocvec(stats).map_err(|e| {
                    Error::StorageUnavailable(format!("stats encoding failed: {e}"))
                })?),
                None => None,
            };
            let seq = index.read().next_seq;

            let write_txn = db
                .begin_write()
                .map_err(|e| Error::StorageUnavailable(format!("failed to begin write: {e}")))?;
            {
                let mut patterns = write_txn
                    .open_table(PATTERNS_TABLE)
                    .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
                patterns
                    .insert(id.as_bytes().as_slice(), row.as_slice())
                    .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

                let mut log = write_txn
                    .open_table(LOG_TABLE)
                    .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
                log.insert(seq, log_entry.as_slice())
                    .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

                if let Some(dim) = persist_dim {
                    let mut meta = write_txn
                        .open_table(META_TABLE)
                        .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
                    meta.insert(META_EMBEDDING_DIM, (dim as u32).to_be_bytes().as_slice())
                        .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
                }

                if let (Some(stats), Some(bytes)) = (&stats_row, &stats_bytes) {
                    let mut stats_table = write_txn
                        .open_table(STATS_TABLE)
                        .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
                    stats_table
                        .insert(
                            (stats.context.as_str(), stats.strategy.as_str()),
                            bytes.as_slice(),
                        )
                        .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
                }
            }
            write_txn
                .commit()
                .map_err(|e| Error::StorageUnavailable(format!("failed to commit: {e}")))?;

            // Committed: publish to readers before the blocking task ends,
            // so cancellation of the caller cannot strand the index.
            let mut inner = index.write();
            inner.next_seq = seq + 1;
            if inner.dim.is_none() {
                inner.dim = Some(pattern.embedding.len());
            }
            if let Some(stats) = stats_row {
                inner
                    .stats
                    .insert((stats.context.clone(), stats.strategy.clone()), stats);
            }
            inner.log.push(id);
            inner.patterns.insert(id, pattern);
            Ok(id)
        })
        .await
        .inspect_err(|e| {
            if let Error::Corrupt(msg) = e {
                self.enter_read_only(msg);
            }
        })
    }

    async fn get(&self, id: PatternId) -> Result<Pattern> {
        self.index
            .read()
            .patterns
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound(id))
    }

    async fn attach_outcome(&self, id: PatternId, outcome: Outcome) -> Result<()> {
        self.refuse_if_read_only()?;

        let _writer = self.write_lock.lock().await;

        let mut pattern = {
            let index = self.index.read();
            let pattern = index.patterns.get(&id).ok_or(Error::NotFound(id))?;
            if pattern.outcome.is_some() {
                return Err(Error::AlreadySet(id));
            }
            pattern.clone()
        };
        let outcome = outcome.normalized();
        pattern.outcome = Some(outcome.clone());
        let stats_row = self.next_stats_row(&pattern.context, &pattern.strategy, &outcome);

        let db = Arc::clone(&self.db);
        let index = Arc::clone(&self.index);

        with_db_timeout(move || {
            let row = postcard::to_allocvec(&pattern)
                .map_err(|e| Error::StorageUnavailable(format!("row encoding failed: {e}")))?;
            let log_entry = postcard::to_allocvec(&LogOp::AttachOutcome(id))
                .map_err(|e| Error::StorageUnavailable(format!("log encoding failed: {e}")))?;
            let stats_bytes = postcard::to_allocvec(&stats_row)
                .map_err(|e| Error::StorageUnavailable(format!("stats encoding failed: {e}")))?;
            let seq = index.read().next_seq;

            let write_txn = db
                .begin_write()
                .map_err(|e| Error::StorageUnavailable(format!("failed to begin write: {e}")))?;
            {
                let mut patterns = write_txn
                    .open_table(PATTERNS_TABLE)
                    .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
                patterns
                    .insert(id.as_bytes().as_slice(), row.as_slice())
                    .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

                let mut log = write_txn
                    .open_table(LOG_TABLE)
                    .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
                log.insert(seq, log_entry.as_slice())
                    .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

                let mut stats_table = write_txn
                    .open_table(STATS_TABLE)
                    .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
                stats_table
                    .insert(
                        (stats_row.context.as_str(), stats_row.strategy.as_str()),
                        stats_bytes.as_slice(),
                    )
                    .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
            }
            write_txn
                .commit()
                .map_err(|e| Error::StorageUnavailable(format!("failed to commit: {e}")))?;

            let mut inner = index.write();
            inner.next_seq = seq + 1;
            inner
                .stats
                .insert((stats_row.context.clone(), stats_row.strategy.clone()), stats_row);
            inner.patterns.insert(id, pattern);
            Ok(())
        })
        .await
        .inspect_err(|e| {
            if let Error::Corrupt(msg) = e {
                self.enter_read_only(msg);
            }
        })
    }

    async fn query_similar(
        &self,
        embedding: &[f32],
        filter: &QueryFilter,
        k: usize,
    ) -> Result<Vec<ScoredPattern>> {
        let index = self.index.read();
        if let Some(dim) = index.dim {
            if embedding.len() != dim {
                return Err(Error::DimensionMismatch {
                    expected: dim,
                    actual: embedding.len(),
                });
            }
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut results: Vec<ScoredPattern> = index
            .patterns
            .values()
            .filter(|p| filter.admits(p))
            .map(|p| ScoredPattern {
                similarity: similarity(embedding, &p.embedding, self.metric),
                pattern: p.clone(),
            })
            .filter(|scored| filter.clears_floor(scored.similarity))
            .collect();
        rank_results(&mut results, k);
        Ok(results)
    }

    async fn strategy_stats(&self, context: &str) -> Result<Vec<StrategyStats>> {
        let index = self.index.read();
        Ok(index
            .stats
            .range((context.to_string(), String::new())..)
            .take_while(|((ctx, _), _)| ctx == context)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn iter_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<BoxStream<'static, Result<Pattern>>> {
        let index = self.index.read();
        let matching: Vec<Pattern> = index
            .log
            .iter()
            .filter_map(|id| index.patterns.get(id))
            .filter(|p| p.created_at >= since)
            .cloned()
            .collect();
        Ok(stream::iter(matching.into_iter().map(Ok)).boxed())
    }

    async fn pattern_count(&self) -> Result<u64> {
        Ok(self.index.read().patterns.len() as u64)
    }

    async fn embedding_dim(&self) -> Result<Option<usize>> {
        Ok(self.index.read().dim)
    }

    async fn health_check(&self) -> Result<bool> {
        self.check_database().await
    }
}
