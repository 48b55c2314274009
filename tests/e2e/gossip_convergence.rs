//! Gossip convergence: two connected, quiescent peers end up holding the
//! same set of committed pattern ids.

mod common;

use std::time::Duration;

use bank_core::storage::PatternStore;

use common::{fast_config, public_key, spawn_node, wait_until};

#[tokio::test]
async fn connected_peers_converge_to_the_same_ids() {
    let left = spawn_node(31, &[public_key(32)], fast_config()).await;
    let right = spawn_node(32, &[public_key(31)], fast_config()).await;

    for seed in 0..5u64 {
        left.store
            .insert(test_utils::completed_pattern(
                &format!("left {seed}"),
                "shared",
                "alpha",
                seed,
                8,
                true,
                0.9,
            ))
            .await
            .unwrap();
    }
    for seed in 100..105u64 {
        right
            .store
            .insert(test_utils::test_pattern(
                &format!("right {seed}"),
                "shared",
                "beta",
                seed,
                8,
            ))
            .await
            .unwrap();
    }

    right.node.connect(&left.addr.to_string()).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(15), || async {
            left.store.pattern_count().await.unwrap() == 10
                && right.store.pattern_count().await.unwrap() == 10
        })
        .await,
        "both stores should hold the union"
    );

    // Same ids on both sides, outcomes included
    for seed in 0..5u64 {
        let expected = test_utils::completed_pattern(
            &format!("left {seed}"),
            "shared",
            "alpha",
            seed,
            8,
            true,
            0.9,
        );
        let replicated = right.store.get(expected.id).await.unwrap();
        assert_eq!(replicated.outcome, expected.outcome);
    }
    for seed in 100..105u64 {
        let expected =
            test_utils::test_pattern(&format!("right {seed}"), "shared", "beta", seed, 8);
        assert!(left.store.get(expected.id).await.is_ok());
    }
}

#[tokio::test]
async fn duplicate_offers_are_idempotent() {
    let left = spawn_node(33, &[public_key(34)], fast_config()).await;
    let right = spawn_node(34, &[public_key(33)], fast_config()).await;

    let pattern = test_utils::test_pattern("only one", "shared", "alpha", 7, 8);
    left.store.insert(pattern.clone()).await.unwrap();

    right.node.connect(&left.addr.to_string()).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || async {
            right.store.pattern_count().await.unwrap() == 1
        })
        .await
    );

    // Several more gossip rounds re-offer the boundary pattern; nothing
    // duplicates
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(right.store.pattern_count().await.unwrap(), 1);
    assert_eq!(left.store.pattern_count().await.unwrap(), 1);
}
