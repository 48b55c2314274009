//! # Test Utilities
//!
//! Shared helpers for the reasoning bank test suites:
//! - Deterministic embedding generation (seeded, unit-norm)
//! - Pattern and capability fixtures
//! - A deterministic [`Embedder`] implementation

use chrono::{Duration, Utc};
use ed25519_dalek::SigningKey;
use rand::{RngExt, SeedableRng};
use rand_chacha::ChaCha8Rng;

use bank_core::capability::issue_capability;
use bank_core::embedder::Embedder;
use bank_core::types::{IntentCapability, Outcome, Pattern, ScopeSet};

/// Deterministic unit-norm embedding of dimension `dim` derived from
/// `seed`. The same seed always yields the same vector.
pub fn test_embedding(seed: u64, dim: usize) -> Vec<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut v: Vec<f32> = (0..dim).map(|_| rng.random_range(-1.0..1.0)).collect();
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// A pattern with a deterministic embedding and no outcome.
pub fn test_pattern(task: &str, context: &str, strategy: &str, seed: u64, dim: usize) -> Pattern {
    Pattern::new(task, context, strategy, test_embedding(seed, dim), None)
}

/// A pattern carrying an outcome.
pub fn completed_pattern(
    task: &str,
    context: &str,
    strategy: &str,
    seed: u64,
    dim: usize,
    success: bool,
    score: f32,
) -> Pattern {
    Pattern::new(
        task,
        context,
        strategy,
        test_embedding(seed, dim),
        Some(Outcome::new(success, score, 100, "fixture")),
    )
}

/// Deterministic signing key from a seed byte.
pub fn test_signing_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

/// A self-issued capability for `issuer`, valid for an hour, with a
/// unique nonce per `nonce_seed`.
pub fn self_issued_capability(
    issuer: &SigningKey,
    scopes: ScopeSet,
    spend_cap: u32,
    nonce_seed: u8,
) -> IntentCapability {
    let now = Utc::now();
    issue_capability(
        issuer,
        issuer.verifying_key().to_bytes(),
        scopes,
        now - Duration::minutes(1),
        now + Duration::hours(1),
        spend_cap,
        [nonce_seed; 16],
    )
}

/// Deterministic embedder hashing text into a fixed-dimension vector.
pub struct SeededEmbedder {
    dim: usize,
}

impl SeededEmbedder {
    /// Embedder producing `dim`-length vectors.
    #[must_use]
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl Embedder for SeededEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let seed = text.bytes().fold(0u64, |acc, b| {
            acc.wrapping_mul(31).wrapping_add(u64::from(b))
        });
        test_embedding(seed, self.dim)
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}
