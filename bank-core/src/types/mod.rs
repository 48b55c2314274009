//! # Shared Type Vocabulary
//!
//! The record types shared by the store, the learner, and the bus. Encode
//! and decode paths all round-trip through these definitions so that the
//! wire schema and the in-memory representation stay one schema.

mod capability;
mod pattern;
mod recommendation;
mod stats;
pub mod wire;

pub use capability::{IntentCapability, Scope, ScopeSet};
pub use pattern::{Outcome, Pattern, PatternId};
pub use recommendation::{Recommendation, SimilarityDistribution};
pub use stats::StrategyStats;
