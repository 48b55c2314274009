//! # Storage Abstraction
//!
//! The [`PatternStore`] trait unifies durable and in-memory pattern
//! storage. The learner, the bus, and gossip all talk to the store through
//! this interface; writers serialize inside the implementation while
//! readers proceed concurrently and only ever observe committed rows.

mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{Outcome, Pattern, PatternId, StrategyStats};

pub use memory::MemoryPatternStore;

/// A pattern with its similarity to the query embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPattern {
    /// The matched pattern
    pub pattern: Pattern,
    /// Similarity under the store's configured metric
    pub similarity: f32,
}

/// Scalar restrictions applied before similarity ranking.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    /// Only patterns with this context tag
    pub context: Option<String>,
    /// Only patterns carrying an outcome
    pub require_outcome: bool,
    /// Only patterns committed at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Only patterns committed before this instant
    pub until: Option<DateTime<Utc>>,
    /// Similarity floor; candidates at or below it are dropped. `None`
    /// keeps everything, which is what negated-distance metrics need
    /// (their scores never exceed zero)
    pub min_similarity: Option<f32>,
}

impl QueryFilter {
    /// Restrict to one context tag.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Require the outcome to be present.
    #[must_use]
    pub fn with_outcome_required(mut self) -> Self {
        self.require_outcome = true;
        self
    }

    /// Restrict to a `[since, until)` commit-time window.
    #[must_use]
    pub fn with_window(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    /// Raise the similarity floor.
    #[must_use]
    pub fn with_min_similarity(mut self, floor: f32) -> Self {
        self.min_similarity = Some(floor);
        self
    }

    /// True if `score` clears the similarity floor.
    #[must_use]
    pub fn clears_floor(&self, score: f32) -> bool {
        self.min_similarity.is_none_or(|floor| score > floor)
    }

    /// True if `pattern` passes the scalar restrictions.
    #[must_use]
    pub fn admits(&self, pattern: &Pattern) -> bool {
        if let Some(context) = &self.context {
            if &pattern.context != context {
                return false;
            }
        }
        if self.require_outcome && pattern.outcome.is_none() {
            return false;
        }
        if let Some(since) = self.since {
            if pattern.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if pattern.created_at >= until {
                return false;
            }
        }
        true
    }
}

/// Order query results: similarity descending, then newer `created_at`
/// first, then id lexicographic. Truncates to `k`.
pub fn rank_results(results: &mut Vec<ScoredPattern>, k: usize) {
    results.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.pattern.created_at.cmp(&a.pattern.created_at))
            .then_with(|| a.pattern.id.cmp(&b.pattern.id))
    });
    results.truncate(k);
}

/// Unified pattern store interface.
///
/// Every successful `insert` or `attach_outcome` is durable before the
/// call returns (for durable implementations). Multiple readers proceed
/// concurrently; writers serialize internally. Readers never observe a
/// partially attached outcome.
#[async_trait]
pub trait PatternStore: Send + Sync {
    /// Persist a pattern.
    ///
    /// Idempotent on id: re-inserting a byte-identical pattern is a no-op
    /// success returning the same id. A different pattern under an
    /// existing id is [`crate::Error::Duplicate`]; an embedding whose
    /// length disagrees with the store dimension is
    /// [`crate::Error::DimensionMismatch`]. If the pattern carries an
    /// outcome, the matching statistics row is updated in the same commit.
    async fn insert(&self, pattern: Pattern) -> Result<PatternId>;

    /// Fetch a pattern by id, or [`crate::Error::NotFound`].
    async fn get(&self, id: PatternId) -> Result<Pattern>;

    /// Attach an outcome to a committed pattern.
    ///
    /// Fails with [`crate::Error::NotFound`] for an unknown id and
    /// [`crate::Error::AlreadySet`] when the pattern already carries one.
    async fn attach_outcome(&self, id: PatternId, outcome: Outcome) -> Result<()>;

    /// Up to `k` patterns ranked by similarity to `embedding`.
    ///
    /// Results clear `filter.min_similarity`, pass the scalar filter, and
    /// arrive sorted per [`rank_results`].
    async fn query_similar(
        &self,
        embedding: &[f32],
        filter: &QueryFilter,
        k: usize,
    ) -> Result<Vec<ScoredPattern>>;

    /// Snapshot of the statistics rows for one context, sorted by strategy.
    async fn strategy_stats(&self, context: &str) -> Result<Vec<StrategyStats>>;

    /// Finite, non-restartable sequence of patterns with
    /// `created_at >= since`, in commit order. Feeds snapshots and gossip.
    async fn iter_since(&self, since: DateTime<Utc>) -> Result<BoxStream<'static, Result<Pattern>>>;

    /// Number of committed patterns.
    async fn pattern_count(&self) -> Result<u64>;

    /// The store-wide embedding dimension, `None` until the first insert
    /// fixes it.
    async fn embedding_dim(&self) -> Result<Option<usize>>;

    /// Verify the backing medium is reachable.
    async fn health_check(&self) -> Result<bool>;
}
