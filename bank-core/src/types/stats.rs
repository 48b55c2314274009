use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::pattern::now_micros;
use super::Outcome;

/// Derived statistics for one `(context, strategy)` pair.
///
/// Rows exist iff at least one outcome has been observed for the pair, and
/// are recomputed whenever an outcome is attached. They live in the store,
/// never in the learner, so a restart loses nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyStats {
    /// Context tag the row belongs to
    pub context: String,
    /// Strategy identifier the row belongs to
    pub strategy: String,
    /// Number of observed outcomes
    pub count: u64,
    /// Fraction of outcomes with `success = true`, in `[0, 1]`
    pub success_rate: f32,
    /// Mean outcome score, in `[0, 1]`
    pub mean_score: f32,
    /// Timestamp of the most recent observation
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub last_updated: DateTime<Utc>,
}

impl StrategyStats {
    /// Row for a first observation.
    #[must_use]
    pub fn first(context: impl Into<String>, strategy: impl Into<String>, outcome: &Outcome) -> Self {
        Self {
            context: context.into(),
            strategy: strategy.into(),
            count: 1,
            success_rate: if outcome.success { 1.0 } else { 0.0 },
            mean_score: outcome.score.clamp(0.0, 1.0),
            last_updated: now_micros(),
        }
    }

    /// Fold one more observation into the running aggregates.
    pub fn observe(&mut self, outcome: &Outcome) {
        let previous = self.count as f32;
        let next = previous + 1.0;
        let success = if outcome.success { 1.0 } else { 0.0 };
        self.success_rate = (self.success_rate * previous + success) / next;
        self.mean_score = (self.mean_score * previous + outcome.score.clamp(0.0, 1.0)) / next;
        self.count += 1;
        self.last_updated = now_micros();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_track_observations() {
        let mut stats = StrategyStats::first("algo", "quicksort", &Outcome::new(true, 0.8, 5, ""));
        assert_eq!(stats.count, 1);
        assert_eq!(stats.success_rate, 1.0);

        stats.observe(&Outcome::new(false, 0.2, 5, ""));
        assert_eq!(stats.count, 2);
        assert!((stats.success_rate - 0.5).abs() < 1e-6);
        assert!((stats.mean_score - 0.5).abs() < 1e-6);

        stats.observe(&Outcome::new(true, 0.5, 5, ""));
        assert_eq!(stats.count, 3);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn rates_stay_in_unit_interval() {
        let mut stats = StrategyStats::first("c", "s", &Outcome::new(true, 1.0, 0, ""));
        for _ in 0..100 {
            stats.observe(&Outcome::new(true, 1.0, 0, ""));
        }
        assert!(stats.success_rate <= 1.0);
        assert!(stats.mean_score <= 1.0);
    }
}
