//! # Reasoning Bank
//!
//! Facade over the store and the learner: the local programmatic surface
//! consumed by tool shells and the CLI. Operations map one-to-one onto
//! store and learner semantics; the facade adds nothing but wiring.
//!
//! ## Example
//!
//! ```no_run
//! use bank_core::bank::ReasoningBank;
//! use bank_core::config::BankConfig;
//!
//! # #[tokio::main]
//! # async fn main() -> bank_core::Result<()> {
//! let bank = ReasoningBank::in_memory(BankConfig::default());
//! let rec = bank
//!     .recommend("migrate schema", Some("db"), &[0.2, 0.8], None, None)
//!     .await?;
//! println!("{} ({:.2})", rec.strategy, rec.confidence);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tracing::info;

use crate::config::BankConfig;
use crate::embedder::Embedder;
use crate::error::Result;
use crate::learner::{Learner, RecommendQuery};
use crate::storage::{MemoryPatternStore, PatternStore};
use crate::types::{Outcome, Pattern, PatternId, Recommendation, StrategyStats};

/// The adaptive reasoning bank: ingest patterns, retrieve similar prior
/// experience, recommend strategies.
pub struct ReasoningBank {
    store: Arc<dyn PatternStore>,
    learner: Learner,
    config: BankConfig,
    embedder: Option<Arc<dyn Embedder>>,
}

impl ReasoningBank {
    /// Bank over a non-durable in-memory store.
    #[must_use]
    pub fn in_memory(config: BankConfig) -> Self {
        let store: Arc<dyn PatternStore> = match config.embedding_dim {
            Some(dim) => Arc::new(MemoryPatternStore::with_dim(config.similarity_metric, dim)),
            None => Arc::new(MemoryPatternStore::new(config.similarity_metric)),
        };
        Self::with_store(config, store)
    }

    /// Bank over a caller-provided store (typically the durable backend).
    #[must_use]
    pub fn with_store(config: BankConfig, store: Arc<dyn PatternStore>) -> Self {
        let learner = Learner::new(Arc::clone(&store), config.recommend.clone());
        Self {
            store,
            learner,
            config,
            embedder: None,
        }
    }

    /// Attach a caller-supplied embedder for the text-only entry points.
    #[must_use]
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// The underlying store, shared with the bus and gossip.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn PatternStore> {
        &self.store
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &BankConfig {
        &self.config
    }

    /// Persist one task execution record. Returns its content-derived id.
    pub async fn store_pattern(
        &self,
        task: &str,
        context: &str,
        strategy: &str,
        embedding: Vec<f32>,
        outcome: Option<Outcome>,
    ) -> Result<PatternId> {
        let pattern = Pattern::new(task, context, strategy, embedding, outcome);
        let id = self.store.insert(pattern).await?;
        info!(%id, context, strategy, "pattern stored");
        Ok(id)
    }

    /// Attach an outcome to a committed pattern; one-shot.
    pub async fn attach_outcome(&self, id: PatternId, outcome: Outcome) -> Result<()> {
        self.store.attach_outcome(id, outcome).await?;
        info!(%id, "outcome attached");
        Ok(())
    }

    /// Fetch a pattern by id.
    pub async fn get_pattern(&self, id: PatternId) -> Result<Pattern> {
        self.store.get(id).await
    }

    /// Recommend a strategy for a task described by `embedding`.
    pub async fn recommend(
        &self,
        task: &str,
        context: Option<&str>,
        embedding: &[f32],
        k: Option<usize>,
        min_similarity: Option<f32>,
    ) -> Result<Recommendation> {
        self.learner
            .recommend(&RecommendQuery {
                task: task.to_string(),
                context: context.map(str::to_string),
                embedding: embedding.to_vec(),
                k,
                min_similarity,
            })
            .await
    }

    /// Recommend using the attached embedder to vectorize `task`.
    ///
    /// Fails with [`crate::Error::BadParameters`] when no embedder is
    /// attached.
    pub async fn recommend_text(
        &self,
        task: &str,
        context: Option<&str>,
        k: Option<usize>,
        min_similarity: Option<f32>,
    ) -> Result<Recommendation> {
        let embedder = self.embedder.as_ref().ok_or_else(|| {
            crate::Error::BadParameters("no embedder attached; supply an embedding".to_string())
        })?;
        let embedding = embedder.embed(task);
        self.recommend(task, context, &embedding, k, min_similarity)
            .await
    }

    /// Record a pattern together with its outcome (insert-or-attach).
    pub async fn observe(&self, pattern: Pattern) -> Result<PatternId> {
        self.learner.observe(pattern).await
    }

    /// Snapshot of statistics rows for one context.
    pub async fn strategy_stats(&self, context: &str) -> Result<Vec<StrategyStats>> {
        self.store.strategy_stats(context).await
    }
}
