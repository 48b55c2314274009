//! # Adaptive Learner
//!
//! Turns a query (task text + context + embedding) into a strategy
//! recommendation, and keeps per-strategy statistics current by funneling
//! observed outcomes into the store.
//!
//! The learner owns no persistent state: retrieval, weighting, and
//! confidence are recomputed from the store on every call, which keeps it
//! trivially consistent across restarts. Given identical store contents
//! and identical arguments, `recommend` returns identical output: every
//! tie-break is specified and there is no internal randomness.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::RecommendConfig;
use crate::error::{Error, Result};
use crate::storage::{PatternStore, QueryFilter, ScoredPattern};
use crate::types::{Outcome, Pattern, PatternId, Recommendation, SimilarityDistribution};

/// Guard against division by a vanishing evidence mass.
const EPSILON: f32 = 1e-6;

/// One recommendation request.
#[derive(Debug, Clone)]
pub struct RecommendQuery {
    /// Task description (carried into the rationale; retrieval uses the
    /// embedding)
    pub task: String,
    /// Restrict retrieval to this context when present
    pub context: Option<String>,
    /// Query embedding; length must equal the store dimension
    pub embedding: Vec<f32>,
    /// Neighbor count; defaults to the configured `k`
    pub k: Option<usize>,
    /// Similarity floor; defaults to the configured `min_similarity`
    pub min_similarity: Option<f32>,
}

/// Strategy scorer over patterns retrieved from the store.
pub struct Learner {
    store: Arc<dyn PatternStore>,
    config: RecommendConfig,
}

struct StrategyGroup<'a> {
    members: Vec<(&'a ScoredPattern, f32)>,
    numerator: f32,
    denominator: f32,
}

impl Learner {
    /// Learner reading from `store` with the given tuning.
    #[must_use]
    pub fn new(store: Arc<dyn PatternStore>, config: RecommendConfig) -> Self {
        Self { store, config }
    }

    /// The store this learner reads from.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn PatternStore> {
        &self.store
    }

    /// Record a pattern together with its outcome.
    ///
    /// Inserts the pattern when its id is new; attaches the outcome when
    /// the pattern exists without one. Statistics update inside the store
    /// as part of the same commit.
    pub async fn observe(&self, pattern: Pattern) -> Result<PatternId> {
        let id = pattern.id;
        match self.store.get(id).await {
            Ok(existing) => {
                if existing.outcome.is_none() {
                    if let Some(outcome) = pattern.outcome {
                        self.store.attach_outcome(id, outcome).await?;
                    }
                }
                Ok(id)
            }
            Err(Error::NotFound(_)) => self.store.insert(pattern).await,
            Err(e) => Err(e),
        }
    }

    /// Convenience for attaching a later outcome by id.
    pub async fn observe_outcome(&self, id: PatternId, outcome: Outcome) -> Result<()> {
        self.store.attach_outcome(id, outcome).await
    }

    /// Produce a strategy recommendation for `query`.
    pub async fn recommend(&self, query: &RecommendQuery) -> Result<Recommendation> {
        if let Some(dim) = self.store.embedding_dim().await? {
            if query.embedding.len() != dim {
                return Err(Error::DimensionMismatch {
                    expected: dim,
                    actual: query.embedding.len(),
                });
            }
        }

        let k = query.k.unwrap_or(self.config.k);
        let min_similarity = query.min_similarity.unwrap_or(self.config.min_similarity);

        let mut filter = QueryFilter::default();
        if let Some(context) = &query.context {
            filter = filter.with_context(context.clone());
        }

        let neighbors: Vec<ScoredPattern> = if k == 0 {
            Vec::new()
        } else {
            self.store
                .query_similar(&query.embedding, &filter, k)
                .await?
                .into_iter()
                .filter(|n| n.similarity >= min_similarity)
                .collect()
        };

        if neighbors.is_empty() {
            debug!(task = %query.task, "no qualifying neighbors; falling back to default strategy");
            return Ok(Recommendation::fallback(
                self.config.default_strategy.clone(),
                query.context.as_deref(),
            ));
        }

        // Partition by strategy; BTreeMap keeps group iteration ordered.
        let mut groups: BTreeMap<&str, StrategyGroup<'_>> = BTreeMap::new();
        for neighbor in &neighbors {
            let weight = self.pattern_weight(neighbor);
            let group = groups
                .entry(neighbor.pattern.strategy.as_str())
                .or_insert_with(|| StrategyGroup {
                    members: Vec::new(),
                    numerator: 0.0,
                    denominator: 0.0,
                });
            group.numerator += weight * self.success_indicator(&neighbor.pattern);
            group.denominator += weight;
            group.members.push((neighbor, weight));
        }

        let total_mass: f32 = groups.values().map(|g| g.denominator).sum();
        let total_mass = total_mass.max(EPSILON);

        let winner = self
            .pick_winner(&groups, total_mass, query.context.as_deref())
            .await?;
        let group = &groups[winner.as_str()];

        let group_score = group.numerator / group.denominator.max(EPSILON);
        let confidence = (group_score * sigmoid((group.denominator - self.config.tau) / self.config.sigma))
            .clamp(0.0, 1.0);

        // Supporting evidence: strongest weight first, deterministic on ties.
        let mut members: Vec<(&ScoredPattern, f32)> = group.members.clone();
        members.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.pattern.id.cmp(&b.0.pattern.id))
        });
        let cap = self.config.max_supporting.unwrap_or(k);
        members.truncate(cap);

        let supporting_pattern_ids: Vec<PatternId> =
            members.iter().map(|(n, _)| n.pattern.id).collect();
        let scores: Vec<f32> = members.iter().map(|(n, _)| n.similarity).collect();
        let with_outcome = group
            .members
            .iter()
            .filter(|(n, _)| n.pattern.outcome.is_some())
            .count();

        let rationale_summary = format!(
            "`{}` chosen from {} similar pattern(s) ({} with outcomes); weighted score {:.3}, evidence mass {:.3} of {:.3}",
            winner,
            group.members.len(),
            with_outcome,
            group_score,
            group.denominator,
            total_mass,
        );

        Ok(Recommendation {
            strategy: winner,
            confidence,
            supporting_pattern_ids,
            rationale_summary,
            similarity_distribution: SimilarityDistribution::from_scores(&scores),
        })
    }

    /// `w(p) = max(0, similarity) · outcome_weight(p)`.
    fn pattern_weight(&self, neighbor: &ScoredPattern) -> f32 {
        let outcome_weight = match &neighbor.pattern.outcome {
            Some(outcome) => outcome.score,
            None => self.config.prior_outcome,
        };
        neighbor.similarity.max(0.0) * outcome_weight
    }

    /// 1 for observed successes, the score for observed failures, half the
    /// prior for patterns still awaiting an outcome.
    fn success_indicator(&self, pattern: &Pattern) -> f32 {
        match &pattern.outcome {
            Some(outcome) if outcome.success => 1.0,
            Some(outcome) => outcome.score,
            None => self.config.prior_outcome / 2.0,
        }
    }

    /// Maximize `score(g) · (α + (1-α)·mass(g))`; ties go to the strategy
    /// with the higher observed count in global stats, then the
    /// lexicographically smaller name.
    async fn pick_winner(
        &self,
        groups: &BTreeMap<&str, StrategyGroup<'_>>,
        total_mass: f32,
        context: Option<&str>,
    ) -> Result<String> {
        let alpha = self.config.alpha;

        let mut best_score = f32::NEG_INFINITY;
        let mut tied: Vec<&str> = Vec::new();
        for (&strategy, group) in groups {
            let score = group.numerator / group.denominator.max(EPSILON);
            let mass = group.denominator / total_mass;
            let adjusted = score * (alpha + (1.0 - alpha) * mass);
            if adjusted > best_score {
                best_score = adjusted;
                tied = vec![strategy];
            } else if adjusted == best_score {
                tied.push(strategy);
            }
        }

        if tied.len() <= 1 {
            return Ok(tied.first().map(|s| (*s).to_string()).unwrap_or_default());
        }

        // Tie: consult global stats for the context, highest count wins.
        let stats = match context {
            Some(ctx) => self.store.strategy_stats(ctx).await?,
            None => Vec::new(),
        };
        let count_of = |strategy: &str| -> u64 {
            stats
                .iter()
                .find(|row| row.strategy == strategy)
                .map_or(0, |row| row.count)
        };

        // `tied` came from a BTreeMap walk, so it is already sorted by
        // name; a stable max-by over count preserves lexicographic order
        // among equal counts.
        let mut winner = tied[0];
        for &candidate in &tied[1..] {
            if count_of(candidate) > count_of(winner) {
                winner = candidate;
            }
        }
        Ok(winner.to_string())
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests;
