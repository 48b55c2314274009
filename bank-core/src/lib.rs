#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_docs_in_private_items)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::float_cmp)]

//! # Bank Core
//!
//! Core data structures and algorithms for the adaptive reasoning bank.
//!
//! The bank ingests task execution records ("patterns"), retrieves similar
//! prior experiences on demand, and emits ranked strategy recommendations
//! with calibrated confidence. This crate holds everything the store, the
//! learner, and the neural bus share:
//!
//! ## Core Concepts
//!
//! - **Patterns**: Immutable records of one prior task attempt, with a
//!   vector embedding and an optional outcome
//! - **Strategy statistics**: Per `(context, strategy)` success rates,
//!   derived from observed outcomes
//! - **Recommendations**: Strategy suggestions with confidence and
//!   supporting evidence
//! - **Intent capabilities**: Signed tokens bounding what a remote peer
//!   may do (scopes, validity window, spend cap)
//!
//! ## Module Organization
//!
//! - [`types`]: Shared record vocabulary (patterns, stats, wire payloads)
//! - [`storage`]: The [`storage::PatternStore`] trait and an in-memory
//!   implementation
//! - [`learner`]: Pattern matching, strategy scoring, and recommendation
//! - [`similarity`]: The pure similarity kernel
//! - [`capability`]: Capability tokens, verification, and the keyring
//! - [`bank`]: The [`bank::ReasoningBank`] facade consumed by tool shells
//! - [`config`]: Recognized configuration with defaults
//!
//! ## Quick Start
//!
//! ```no_run
//! use bank_core::bank::ReasoningBank;
//! use bank_core::config::BankConfig;
//! use bank_core::types::Outcome;
//!
//! #[tokio::main]
//! async fn main() -> bank_core::Result<()> {
//!     let bank = ReasoningBank::in_memory(BankConfig::default());
//!
//!     // Record a prior attempt with its outcome
//!     let id = bank
//!         .store_pattern(
//!             "sort N integers",
//!             "algo",
//!             "mergesort",
//!             vec![0.1, 0.7, 0.2],
//!             Some(Outcome::new(true, 0.95, 1200, "stable and fast")),
//!         )
//!         .await?;
//!
//!     // Ask for a strategy on a similar task
//!     let rec = bank
//!         .recommend("sort a large array", Some("algo"), &[0.1, 0.68, 0.22], None, None)
//!         .await?;
//!     println!("try `{}` (confidence {:.2})", rec.strategy, rec.confidence);
//!     let _ = id;
//!     Ok(())
//! }
//! ```

pub mod bank;
pub mod capability;
pub mod config;
pub mod embedder;
pub mod error;
pub mod learner;
pub mod similarity;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use bank::ReasoningBank;
pub use capability::{
    issue_capability, verify_capability, verify_capability_bounds, CapabilityError, Keyring,
};
pub use config::{BankConfig, BusConfig, CapabilityConfig, GossipConfig, RecommendConfig};
pub use embedder::Embedder;
pub use error::{Error, Result};
pub use learner::{Learner, RecommendQuery};
pub use similarity::{similarity, SimilarityMetric};
pub use storage::{MemoryPatternStore, PatternStore, QueryFilter, ScoredPattern};
pub use types::{
    IntentCapability, Outcome, Pattern, PatternId, Recommendation, Scope, ScopeSet,
    SimilarityDistribution, StrategyStats,
};
