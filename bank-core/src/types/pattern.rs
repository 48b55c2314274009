use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Now, truncated to the microsecond precision the wire and disk
/// encodings carry, so a committed timestamp survives any round trip
/// bit-for-bit.
pub(crate) fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

/// Content-derived identifier of a pattern.
///
/// A `PatternId` is the blake3 hash of the canonical encoding of the
/// pattern's immutable fields (`task`, `context`, `strategy`, `embedding`).
/// The same content always hashes to the same id, which is what makes
/// `insert` idempotent across processes and peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatternId([u8; 32]);

impl PatternId {
    /// Derive the id from a pattern's immutable content.
    #[must_use]
    pub fn derive(task: &str, context: &str, strategy: &str, embedding: &[f32]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(task.len() as u64).to_be_bytes());
        hasher.update(task.as_bytes());
        hasher.update(&(context.len() as u64).to_be_bytes());
        hasher.update(context.as_bytes());
        hasher.update(&(strategy.len() as u64).to_be_bytes());
        hasher.update(strategy.as_bytes());
        hasher.update(&(embedding.len() as u64).to_be_bytes());
        for value in embedding {
            hasher.update(&value.to_be_bytes());
        }
        Self(*hasher.finalize().as_bytes())
    }

    /// Raw 32-byte value.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Construct from raw bytes (e.g. decoded from the wire).
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for PatternId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for PatternId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| format!("invalid pattern id: {e}"))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "invalid pattern id: expected 32 bytes".to_string())?;
        Ok(Self(arr))
    }
}

/// Post-hoc evaluation of a pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// Whether the strategy succeeded on this task
    pub success: bool,
    /// Numeric quality score in `[0, 1]`
    pub score: f32,
    /// Wall-clock duration of the attempt
    pub duration_ms: u64,
    /// Free-text evaluation notes
    pub notes: String,
}

impl Outcome {
    /// Create an outcome, clamping `score` into `[0, 1]`.
    #[must_use]
    pub fn new(success: bool, score: f32, duration_ms: u64, notes: impl Into<String>) -> Self {
        Self {
            success,
            score: score.clamp(0.0, 1.0),
            duration_ms,
            notes: notes.into(),
        }
    }

    /// Copy with the score clamped into `[0, 1]`.
    ///
    /// Applied at store boundaries so that rows committed from remote
    /// peers satisfy the score invariant regardless of how they were built.
    #[must_use]
    pub fn normalized(&self) -> Self {
        Self {
            score: self.score.clamp(0.0, 1.0),
            ..self.clone()
        }
    }
}

/// A record of one prior task attempt.
///
/// Immutable once committed; the only permitted mutation is attaching the
/// outcome exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    /// Content-derived identifier
    pub id: PatternId,
    /// Short free-text task description
    pub task: String,
    /// Grouping tag, e.g. a domain or workflow name
    pub context: String,
    /// Identifier of the approach taken
    pub strategy: String,
    /// Fixed-length embedding vector; length equals the store dimension `D`
    pub embedding: Vec<f32>,
    /// Commit timestamp
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub created_at: DateTime<Utc>,
    /// Post-hoc evaluation, attached at most once
    pub outcome: Option<Outcome>,
}

impl Pattern {
    /// Build a pattern, deriving its id from the immutable content.
    #[must_use]
    pub fn new(
        task: impl Into<String>,
        context: impl Into<String>,
        strategy: impl Into<String>,
        embedding: Vec<f32>,
        outcome: Option<Outcome>,
    ) -> Self {
        let task = task.into();
        let context = context.into();
        let strategy = strategy.into();
        let id = PatternId::derive(&task, &context, &strategy, &embedding);
        Self {
            id,
            task,
            context,
            strategy,
            embedding,
            created_at: now_micros(),
            outcome: outcome.map(|o| o.normalized()),
        }
    }

    /// True if the stated id matches the content-derived id.
    #[must_use]
    pub fn id_matches_content(&self) -> bool {
        self.id == PatternId::derive(&self.task, &self.context, &self.strategy, &self.embedding)
    }

    /// True if the immutable content of `self` and `other` is identical.
    ///
    /// Outcomes and timestamps are not part of the comparison; two commits
    /// of the same attempt are the same pattern.
    #[must_use]
    pub fn same_content(&self, other: &Pattern) -> bool {
        self.task == other.task
            && self.context == other.context
            && self.strategy == other.strategy
            && self.embedding == other.embedding
    }

    /// Hash of the full record including the outcome, used in gossip
    /// summaries so peers can cheaply compare what they hold.
    #[must_use]
    pub fn content_hash(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.id.as_bytes());
        match &self.outcome {
            Some(outcome) => {
                hasher.update(&[1u8, u8::from(outcome.success)]);
                hasher.update(&outcome.score.to_be_bytes());
                hasher.update(&outcome.duration_ms.to_be_bytes());
                hasher.update(outcome.notes.as_bytes());
            }
            None => {
                hasher.update(&[0u8]);
            }
        }
        *hasher.finalize().as_bytes()
    }
}
