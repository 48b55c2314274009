// ============================================================================
// Configuration
// ============================================================================

//! Recognized configuration for the bank, the bus, and gossip, with the
//! documented defaults. The CLI deserializes this tree from a toml file;
//! library callers construct it directly.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::similarity::SimilarityMetric;

/// Tuning for the recommendation algorithm.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommendConfig {
    /// Default neighbor count for a query
    pub k: usize,
    /// Similarity floor a neighbor must clear to count
    pub min_similarity: f32,
    /// Outcome weight applied to patterns without outcomes
    pub prior_outcome: f32,
    /// Risk aversion blending per-strategy score and distributional mass
    pub alpha: f32,
    /// Confidence sigmoid midpoint over evidence weight
    pub tau: f32,
    /// Confidence sigmoid spread
    pub sigma: f32,
    /// Strategy returned when no neighbor qualifies
    pub default_strategy: String,
    /// Cap on supporting pattern ids in a recommendation; defaults to `k`
    pub max_supporting: Option<usize>,
}

impl Default for RecommendConfig {
    fn default() -> Self {
        Self {
            k: 8,
            min_similarity: 0.5,
            prior_outcome: 0.25,
            alpha: 0.3,
            tau: 1.0,
            sigma: 1.0,
            default_strategy: "noop".to_string(),
            max_supporting: None,
        }
    }
}

/// Resource caps and timeouts for the neural bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Maximum concurrent sessions per process
    pub max_sessions: usize,
    /// Maximum concurrent streams per session
    pub max_streams_per_session: usize,
    /// Maximum frame payload size in bytes
    pub max_frame_bytes: u32,
    /// Flow-control credit (frames) granted per stream at open
    pub credit_per_stream: u32,
    /// Keep-alive ping interval in seconds
    pub keepalive_interval_secs: u64,
    /// Pongs that may go missing before the session closes
    pub keepalive_misses: u32,
    /// Handshake deadline in seconds
    pub handshake_timeout_secs: u64,
    /// Grace given to in-flight streams while draining, in seconds
    pub drain_timeout_secs: u64,
    /// Stall deadline for one snapshot chunk, in seconds
    pub snapshot_chunk_timeout_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_sessions: 1024,
            max_streams_per_session: 64,
            max_frame_bytes: 16 * 1024 * 1024,
            credit_per_stream: 32,
            keepalive_interval_secs: 15,
            keepalive_misses: 3,
            handshake_timeout_secs: 5,
            drain_timeout_secs: 10,
            snapshot_chunk_timeout_secs: 30,
        }
    }
}

/// Pacing for periodic pattern-summary exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Seconds between gossip rounds per peer
    pub interval_secs: u64,
    /// Offers sent per round
    pub batch_size: usize,
    /// Cap on offers queued toward one peer
    pub max_pending_offers: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            batch_size: 256,
            max_pending_offers: 10_000,
        }
    }
}

/// Capability verification knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    /// Entries retained in the nonce replay window
    pub replay_window: usize,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self { replay_window: 4096 }
    }
}

/// Top-level configuration for one bank instance.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BankConfig {
    /// Root directory for the persistent store
    pub data_dir: Option<PathBuf>,
    /// Fixes the embedding dimension on first creation; changing it on an
    /// existing store is refused
    pub embedding_dim: Option<usize>,
    /// Similarity metric used by retrieval
    pub similarity_metric: SimilarityMetric,
    /// Recommendation tuning
    pub recommend: RecommendConfig,
    /// Bus caps and timeouts
    pub bus: BusConfig,
    /// Gossip pacing
    pub gossip: GossipConfig,
    /// Capability verification knobs
    pub capability: CapabilityConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = BankConfig::default();
        assert_eq!(config.recommend.k, 8);
        assert_eq!(config.recommend.min_similarity, 0.5);
        assert_eq!(config.recommend.prior_outcome, 0.25);
        assert_eq!(config.recommend.alpha, 0.3);
        assert_eq!(config.recommend.default_strategy, "noop");
        assert_eq!(config.bus.max_sessions, 1024);
        assert_eq!(config.bus.max_streams_per_session, 64);
        assert_eq!(config.bus.max_frame_bytes, 16 * 1024 * 1024);
        assert_eq!(config.gossip.interval_secs, 30);
        assert_eq!(config.capability.replay_window, 4096);
    }
}
