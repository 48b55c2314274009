//! Scenario: a fresh peer bulk-loads the sender's store with a snapshot,
//! then picks up concurrent inserts through gossip.

mod common;

use std::time::Duration;

use bank_core::storage::PatternStore;
use chrono::{DateTime, Utc};

use common::{fast_config, public_key, spawn_node, wait_until};

#[tokio::test]
async fn snapshot_transfers_the_whole_store() {
    let server = spawn_node(21, &[public_key(22)], fast_config()).await;
    let client = spawn_node(22, &[public_key(21)], fast_config()).await;

    // Enough patterns for several chunks
    for seed in 0..300u64 {
        server
            .store
            .insert(test_utils::completed_pattern(
                &format!("prior {seed}"),
                "corpus",
                if seed % 2 == 0 { "alpha" } else { "beta" },
                seed,
                8,
                seed % 3 != 0,
                0.8,
            ))
            .await
            .unwrap();
    }

    let session = client.node.connect(&server.addr.to_string()).await.unwrap();
    let received = session
        .request_snapshot(DateTime::<Utc>::MIN_UTC)
        .await
        .unwrap();
    assert_eq!(received, 300);
    assert_eq!(client.store.pattern_count().await.unwrap(), 300);

    // Every id made it across
    for seed in [0u64, 7, 150, 299] {
        let expected = test_utils::completed_pattern(
            &format!("prior {seed}"),
            "corpus",
            if seed % 2 == 0 { "alpha" } else { "beta" },
            seed,
            8,
            seed % 3 != 0,
            0.8,
        );
        assert!(client.store.get(expected.id).await.is_ok(), "missing {seed}");
    }

    // Fresh inserts during/after the snapshot flow through gossip
    for seed in 1000..1002u64 {
        server
            .store
            .insert(test_utils::test_pattern(
                &format!("fresh {seed}"),
                "corpus",
                "gamma",
                seed,
                8,
            ))
            .await
            .unwrap();
    }
    assert!(
        wait_until(Duration::from_secs(10), || async {
            client.store.pattern_count().await.unwrap() == 302
        })
        .await,
        "gossip should deliver the two fresh inserts"
    );
}

#[tokio::test]
async fn snapshot_of_an_empty_store_is_empty() {
    let server = spawn_node(23, &[public_key(24)], fast_config()).await;
    let client = spawn_node(24, &[public_key(23)], fast_config()).await;

    let session = client.node.connect(&server.addr.to_string()).await.unwrap();
    let received = session
        .request_snapshot(DateTime::<Utc>::MIN_UTC)
        .await
        .unwrap();
    assert_eq!(received, 0);
    assert_eq!(client.store.pattern_count().await.unwrap(), 0);
}

#[tokio::test]
async fn snapshot_respects_the_since_mark() {
    let server = spawn_node(25, &[public_key(26)], fast_config()).await;
    let client = spawn_node(26, &[public_key(25)], fast_config()).await;

    for seed in 0..5u64 {
        server
            .store
            .insert(test_utils::test_pattern(
                &format!("old {seed}"),
                "corpus",
                "alpha",
                seed,
                8,
            ))
            .await
            .unwrap();
    }
    let cut = Utc::now();
    tokio::time::sleep(Duration::from_millis(10)).await;
    for seed in 100..103u64 {
        server
            .store
            .insert(test_utils::test_pattern(
                &format!("new {seed}"),
                "corpus",
                "beta",
                seed,
                8,
            ))
            .await
            .unwrap();
    }

    let session = client.node.connect(&server.addr.to_string()).await.unwrap();
    let received = session.request_snapshot(cut).await.unwrap();
    assert_eq!(received, 3, "only patterns at or after the mark transfer");
}
