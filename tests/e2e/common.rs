//! Shared setup for the end-to-end suites: paired bus nodes over
//! loopback TCP with in-memory stores and self-issued capabilities.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bank_bus::BusNode;
use bank_core::config::BankConfig;
use bank_core::similarity::SimilarityMetric;
use bank_core::storage::{MemoryPatternStore, PatternStore};
use bank_core::types::ScopeSet;
use bank_core::Keyring;

/// Config tuned for fast tests: 1 s gossip, short timeouts.
pub fn fast_config() -> BankConfig {
    let mut config = BankConfig::default();
    config.gossip.interval_secs = 1;
    config.bus.keepalive_interval_secs = 5;
    config.bus.drain_timeout_secs = 2;
    config
}

/// One bus node over an in-memory store.
pub struct TestNode {
    pub node: BusNode,
    pub store: Arc<MemoryPatternStore>,
    pub addr: SocketAddr,
    pub key_seed: u8,
}

/// Spawn a listening node with key seed `seed`, trusting `trusted` peer
/// keys (its own is always trusted so self-issued capabilities verify).
pub async fn spawn_node(seed: u8, trusted: &[[u8; 32]], config: BankConfig) -> TestNode {
    let store = Arc::new(MemoryPatternStore::new(SimilarityMetric::Cosine));
    let signing = test_utils::test_signing_key(seed);
    let mut keyring = Keyring::new();
    keyring.trust(signing.verifying_key().to_bytes());
    for key in trusted {
        keyring.trust(*key);
    }

    let node = BusNode::new(
        Arc::clone(&store) as Arc<dyn PatternStore>,
        signing.clone(),
        keyring,
        config,
    );
    node.set_local_capability(test_utils::self_issued_capability(
        &signing,
        ScopeSet::all(),
        1024,
        seed,
    ));
    let addr = node.listen("127.0.0.1:0").await.expect("listen");
    TestNode {
        node,
        store,
        addr,
        key_seed: seed,
    }
}

/// Public key for a node seed.
pub fn public_key(seed: u8) -> [u8; 32] {
    test_utils::test_signing_key(seed)
        .verifying_key()
        .to_bytes()
}

/// Poll `probe` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if probe().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
