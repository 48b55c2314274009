//! End-to-end bank workflows over the durable store: insert and recall,
//! the outcome flip, and durability across restart.

use std::sync::Arc;

use bank_core::bank::ReasoningBank;
use bank_core::config::BankConfig;
use bank_core::similarity::SimilarityMetric;
use bank_core::storage::PatternStore;
use bank_core::types::Outcome;
use bank_storage_redb::RedbPatternStore;
use tempfile::TempDir;

async fn durable_bank(dir: &TempDir) -> (ReasoningBank, Arc<RedbPatternStore>) {
    let store = Arc::new(
        RedbPatternStore::open(
            &dir.path().join("bank.redb"),
            SimilarityMetric::Cosine,
            None,
        )
        .await
        .expect("open store"),
    );
    let bank = ReasoningBank::with_store(
        BankConfig::default(),
        Arc::clone(&store) as Arc<dyn PatternStore>,
    );
    (bank, store)
}

#[tokio::test]
async fn insert_and_recall_recommends_the_nearest_strategy() {
    let dir = TempDir::new().unwrap();
    let (bank, _) = durable_bank(&dir).await;

    // e2 sits nearest the query; mergesort has two strong outcomes
    bank.store_pattern(
        "sort N integers",
        "algo",
        "quicksort",
        vec![0.9, 0.44],
        Some(Outcome::new(true, 0.9, 700, "")),
    )
    .await
    .unwrap();
    let p2 = bank
        .store_pattern(
            "sort N integers stably",
            "algo",
            "mergesort",
            vec![1.0, 0.05],
            Some(Outcome::new(true, 0.95, 900, "")),
        )
        .await
        .unwrap();
    bank.store_pattern(
        "sort keyed records",
        "algo",
        "mergesort",
        vec![0.98, 0.1],
        Some(Outcome::new(true, 0.9, 950, "")),
    )
    .await
    .unwrap();
    bank.store_pattern(
        "sort a short list",
        "algo",
        "bubble",
        vec![0.5, 0.87],
        Some(Outcome::new(false, 0.2, 4000, "")),
    )
    .await
    .unwrap();

    let rec = bank
        .recommend("sort a large array", Some("algo"), &[1.0, 0.0], None, None)
        .await
        .unwrap();

    assert_eq!(rec.strategy, "mergesort");
    assert!(rec.confidence > 0.5, "confidence {}", rec.confidence);
    assert!(rec.supporting_pattern_ids.contains(&p2));
}

#[tokio::test]
async fn outcome_flip_lowers_confidence_and_updates_stats() {
    let dir = TempDir::new().unwrap();
    let (bank, _) = durable_bank(&dir).await;

    let id = bank
        .store_pattern("deploy service", "ops", "blue_green", vec![1.0, 0.0], None)
        .await
        .unwrap();

    let before = bank
        .recommend("deploy the service", Some("ops"), &[1.0, 0.0], None, None)
        .await
        .unwrap();
    assert_eq!(before.strategy, "blue_green");
    assert!(before.confidence > 0.0);

    bank.attach_outcome(id, Outcome::new(false, 0.1, 30_000, "rollback"))
        .await
        .unwrap();

    let after = bank
        .recommend("deploy the service", Some("ops"), &[1.0, 0.0], None, None)
        .await
        .unwrap();
    assert!(
        after.confidence < before.confidence,
        "expected {} < {}",
        after.confidence,
        before.confidence
    );

    let stats = bank.strategy_stats("ops").await.unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].strategy, "blue_green");
    assert_eq!(stats[0].count, 1);
    assert_eq!(stats[0].success_rate, 0.0);
}

#[tokio::test]
async fn recommendations_are_identical_across_restart() {
    let dir = TempDir::new().unwrap();
    let first = {
        let (bank, _) = durable_bank(&dir).await;
        for seed in 0..6u64 {
            bank.store_pattern(
                &format!("task {seed}"),
                "algo",
                if seed % 2 == 0 { "left" } else { "right" },
                test_utils::test_embedding(seed % 3, 8),
                Some(Outcome::new(seed % 2 == 0, 0.7, 10, "")),
            )
            .await
            .unwrap();
        }
        bank.recommend("task", Some("algo"), &test_utils::test_embedding(0, 8), None, None)
            .await
            .unwrap()
    };

    // Same store contents after reopen: byte-identical recommendation
    let (bank, _) = durable_bank(&dir).await;
    let second = bank
        .recommend("task", Some("algo"), &test_utils::test_embedding(0, 8), None, None)
        .await
        .unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn observe_round_trips_through_the_facade() {
    let dir = TempDir::new().unwrap();
    let (bank, store) = durable_bank(&dir).await;

    let pattern = test_utils::completed_pattern("t", "c", "s", 1, 8, true, 0.8);
    let id = bank.observe(pattern.clone()).await.unwrap();
    assert_eq!(id, pattern.id);
    assert_eq!(store.get(id).await.unwrap().outcome, pattern.outcome);
}
