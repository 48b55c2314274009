use serde::{Deserialize, Serialize};

use super::PatternId;

/// Spread of similarity scores over a recommendation's supporting patterns.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct SimilarityDistribution {
    /// Lowest similarity among supporting patterns
    pub min: f32,
    /// Mean similarity across supporting patterns
    pub mean: f32,
    /// Highest similarity among supporting patterns
    pub max: f32,
}

impl SimilarityDistribution {
    /// Summarize a non-empty slice of similarity scores.
    ///
    /// Returns the zero distribution for an empty slice.
    #[must_use]
    pub fn from_scores(scores: &[f32]) -> Self {
        if scores.is_empty() {
            return Self::default();
        }
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        let mut sum = 0.0;
        for &score in scores {
            min = min.min(score);
            max = max.max(score);
            sum += score;
        }
        Self {
            min,
            mean: sum / scores.len() as f32,
            max,
        }
    }
}

/// A strategy suggestion produced on demand by the learner.
///
/// Recommendations are ephemeral; they are never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    /// The suggested strategy
    pub strategy: String,
    /// Calibrated confidence in `[0, 1]`; `0` when no neighbor qualified
    pub confidence: f32,
    /// Ids of the patterns that support the suggestion, strongest first
    pub supporting_pattern_ids: Vec<PatternId>,
    /// Short human-readable account of how the suggestion was reached
    pub rationale_summary: String,
    /// Min/mean/max similarity over the supporting patterns
    pub similarity_distribution: SimilarityDistribution,
}

impl Recommendation {
    /// The fallback produced when no neighbor clears the similarity floor.
    #[must_use]
    pub fn fallback(strategy: impl Into<String>, context: Option<&str>) -> Self {
        let strategy = strategy.into();
        let rationale_summary = match context {
            Some(ctx) => format!("no sufficiently similar prior patterns in context `{ctx}`; falling back to `{strategy}`"),
            None => format!("no sufficiently similar prior patterns; falling back to `{strategy}`"),
        };
        Self {
            strategy,
            confidence: 0.0,
            supporting_pattern_ids: Vec::new(),
            rationale_summary,
            similarity_distribution: SimilarityDistribution::default(),
        }
    }
}
