//! In-memory [`PatternStore`] used by tests and by callers that do not
//! need durability. Shares the exact operation semantics of the durable
//! backend so the learner and bus behave identically over either.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::similarity::{similarity, SimilarityMetric};
use crate::types::{Outcome, Pattern, PatternId, StrategyStats};

use super::{rank_results, PatternStore, QueryFilter, ScoredPattern};

#[derive(Default)]
struct Inner {
    dim: Option<usize>,
    /// Commit log: insertion order drives `iter_since`
    log: Vec<PatternId>,
    patterns: HashMap<PatternId, Pattern>,
    stats: BTreeMap<(String, String), StrategyStats>,
}

impl Inner {
    fn record_outcome(&mut self, context: &str, strategy: &str, outcome: &Outcome) {
        let key = (context.to_string(), strategy.to_string());
        match self.stats.get_mut(&key) {
            Some(row) => row.observe(outcome),
            None => {
                self.stats
                    .insert(key, StrategyStats::first(context, strategy, outcome));
            }
        }
    }
}

/// Non-durable pattern store backed by process memory.
#[derive(Clone)]
pub struct MemoryPatternStore {
    metric: SimilarityMetric,
    inner: Arc<RwLock<Inner>>,
}

impl MemoryPatternStore {
    /// Empty store; the first insert fixes the embedding dimension.
    #[must_use]
    pub fn new(metric: SimilarityMetric) -> Self {
        Self {
            metric,
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    /// Empty store with the dimension fixed up front.
    #[must_use]
    pub fn with_dim(metric: SimilarityMetric, dim: usize) -> Self {
        let store = Self::new(metric);
        store.inner.write().dim = Some(dim);
        store
    }
}

#[async_trait]
impl PatternStore for MemoryPatternStore {
    async fn insert(&self, pattern: Pattern) -> Result<PatternId> {
        if !pattern.id_matches_content() {
            return Err(Error::BadParameters(format!(
                "pattern id {} does not match its content",
                pattern.id
            )));
        }

        let mut inner = self.inner.write();
        let expected = inner.dim.unwrap_or(pattern.embedding.len());
        if pattern.embedding.len() != expected {
            return Err(Error::DimensionMismatch {
                expected,
                actual: pattern.embedding.len(),
            });
        }

        if let Some(existing) = inner.patterns.get(&pattern.id) {
            if existing.same_content(&pattern) {
                return Ok(pattern.id);
            }
            return Err(Error::Duplicate(pattern.id));
        }

        let mut pattern = pattern;
        pattern.outcome = pattern.outcome.take().map(|o| o.normalized());

        inner.dim = Some(expected);
        if let Some(outcome) = &pattern.outcome {
            inner.record_outcome(&pattern.context, &pattern.strategy, outcome);
        }
        let id = pattern.id;
        inner.log.push(id);
        inner.patterns.insert(id, pattern);
        Ok(id)
    }

    async fn get(&self, id: PatternId) -> Result<Pattern> {
        self.inner
            .read()
            .patterns
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound(id))
    }

    async fn attach_outcome(&self, id: PatternId, outcome: Outcome) -> Result<()> {
        let mut inner = self.inner.write();
        let pattern = inner.patterns.get(&id).ok_or(Error::NotFound(id))?;
        if pattern.outcome.is_some() {
            return Err(Error::AlreadySet(id));
        }
        let context = pattern.context.clone();
        let strategy = pattern.strategy.clone();
        let outcome = outcome.normalized();

        inner.record_outcome(&context, &strategy, &outcome);
        if let Some(pattern) = inner.patterns.get_mut(&id) {
            pattern.outcome = Some(outcome);
        }
        Ok(())
    }

    async fn query_similar(
        &self,
        embedding: &[f32],
        filter: &QueryFilter,
        k: usize,
    ) -> Result<Vec<ScoredPattern>> {
        let inner = self.inner.read();
        if let Some(dim) = inner.dim {
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

        let mut results: Vec<ScoredPattern> = inner
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
        let inner = self.inner.read();
        Ok(inner
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
        let inner = self.inner.read();
        let matching: Vec<Pattern> = inner
            .log
            .iter()
            .filter_map(|id| inner.patterns.get(id))
            .filter(|p| p.created_at >= since)
            .cloned()
            .collect();
        Ok(stream::iter(matching.into_iter().map(Ok)).boxed())
    }

    async fn pattern_count(&self) -> Result<u64> {
        Ok(self.inner.read().patterns.len() as u64)
    }

    async fn embedding_dim(&self) -> Result<Option<usize>> {
        Ok(self.inner.read().dim)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn store() -> MemoryPatternStore {
        MemoryPatternStore::new(SimilarityMetric::Cosine)
    }

    #[tokio::test]
    async fn insert_then_get_returns_the_pattern() {
        let store = store();
        let pattern = Pattern::new("sort", "algo", "quicksort", vec![1.0, 0.0], None);
        let id = store.insert(pattern.clone()).await.unwrap();
        assert_eq!(id, pattern.id);
        assert_eq!(store.get(id).await.unwrap(), pattern);
    }

    #[tokio::test]
    async fn insert_is_idempotent() {
        let store = store();
        let pattern = Pattern::new("sort", "algo", "quicksort", vec![1.0, 0.0], None);
        let first = store.insert(pattern.clone()).await.unwrap();
        let second = store.insert(pattern).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.pattern_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dimension_is_fixed_by_first_insert() {
        let store = store();
        store
            .insert(Pattern::new("a", "c", "s", vec![1.0, 0.0], None))
            .await
            .unwrap();
        let err = store
            .insert(Pattern::new("b", "c", "s", vec![1.0, 0.0, 0.5], None))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch { expected: 2, actual: 3 }
        ));
        assert_eq!(store.pattern_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn attach_outcome_is_one_shot() {
        let store = store();
        let id = store
            .insert(Pattern::new("a", "c", "s", vec![1.0], None))
            .await
            .unwrap();

        store
            .attach_outcome(id, Outcome::new(false, 0.1, 5, ""))
            .await
            .unwrap();
        let err = store
            .attach_outcome(id, Outcome::new(true, 0.9, 5, ""))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadySet(_)));

        // First write stands untouched
        let outcome = store.get(id).await.unwrap().outcome.unwrap();
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn outcome_attach_updates_stats() {
        let store = store();
        let id = store
            .insert(Pattern::new("a", "algo", "quicksort", vec![1.0], None))
            .await
            .unwrap();
        assert!(store.strategy_stats("algo").await.unwrap().is_empty());

        store
            .attach_outcome(id, Outcome::new(false, 0.1, 5, ""))
            .await
            .unwrap();
        let stats = store.strategy_stats("algo").await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].count, 1);
        assert_eq!(stats[0].success_rate, 0.0);
    }

    #[tokio::test]
    async fn query_orders_by_similarity() {
        let store = store();
        store
            .insert(Pattern::new("a", "c", "s1", vec![1.0, 0.0], None))
            .await
            .unwrap();
        store
            .insert(Pattern::new("b", "c", "s2", vec![0.7, 0.7], None))
            .await
            .unwrap();
        store
            .insert(Pattern::new("d", "c", "s3", vec![0.0, 1.0], None))
            .await
            .unwrap();

        let hits = store
            .query_similar(&[1.0, 0.0], &QueryFilter::default(), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].pattern.task, "a");
        assert_eq!(hits[1].pattern.task, "b");
        assert_eq!(hits[2].pattern.task, "d");

        // A floor of zero drops the orthogonal candidate: the floor is
        // strict, candidates must exceed it
        let floored = store
            .query_similar(
                &[1.0, 0.0],
                &QueryFilter::default().with_min_similarity(0.0),
                10,
            )
            .await
            .unwrap();
        assert_eq!(floored.len(), 2);
    }

    #[tokio::test]
    async fn query_respects_filters() {
        let store = store();
        store
            .insert(Pattern::new("a", "algo", "s1", vec![1.0, 0.0], None))
            .await
            .unwrap();
        store
            .insert(Pattern::new(
                "b",
                "web",
                "s2",
                vec![0.9, 0.1],
                Some(Outcome::new(true, 1.0, 1, "")),
            ))
            .await
            .unwrap();

        let by_context = store
            .query_similar(
                &[1.0, 0.0],
                &QueryFilter::default().with_context("algo"),
                10,
            )
            .await
            .unwrap();
        assert_eq!(by_context.len(), 1);
        assert_eq!(by_context[0].pattern.context, "algo");

        let with_outcome = store
            .query_similar(
                &[1.0, 0.0],
                &QueryFilter::default().with_outcome_required(),
                10,
            )
            .await
            .unwrap();
        assert_eq!(with_outcome.len(), 1);
        assert_eq!(with_outcome[0].pattern.context, "web");
    }

    #[tokio::test]
    async fn iter_since_yields_commit_order() {
        let store = store();
        let p1 = Pattern::new("first", "c", "s", vec![1.0], None);
        let p2 = Pattern::new("second", "c", "s", vec![2.0], None);
        store.insert(p1.clone()).await.unwrap();
        store.insert(p2.clone()).await.unwrap();

        let all: Vec<Pattern> = store
            .iter_since(DateTime::<Utc>::MIN_UTC)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].task, "first");
        assert_eq!(all[1].task, "second");
    }

    #[tokio::test]
    async fn k_zero_returns_nothing() {
        let store = store();
        store
            .insert(Pattern::new("a", "c", "s", vec![1.0], None))
            .await
            .unwrap();
        let hits = store
            .query_similar(&[1.0], &QueryFilter::default(), 0)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }
}
