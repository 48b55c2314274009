use std::sync::Arc;

use crate::config::RecommendConfig;
use crate::similarity::SimilarityMetric;
use crate::storage::{MemoryPatternStore, PatternStore};
use crate::types::{Outcome, Pattern};

use super::{Learner, RecommendQuery};

fn learner_over(store: MemoryPatternStore) -> Learner {
    Learner::new(Arc::new(store), RecommendConfig::default())
}

fn query(embedding: Vec<f32>) -> RecommendQuery {
    RecommendQuery {
        task: "sort a large array".to_string(),
        context: Some("algo".to_string()),
        embedding,
        k: None,
        min_similarity: None,
    }
}

async fn seed_sorting_patterns(store: &MemoryPatternStore) {
    // Two mergesort attempts close to the query direction, one quicksort
    // a little further out, one failed bubble sort near the floor.
    for pattern in [
        Pattern::new(
            "sort N integers",
            "algo",
            "mergesort",
            vec![1.0, 0.05],
            Some(Outcome::new(true, 0.95, 900, "stable")),
        ),
        Pattern::new(
            "sort records by key",
            "algo",
            "mergesort",
            vec![0.98, 0.1],
            Some(Outcome::new(true, 0.9, 1100, "")),
        ),
        Pattern::new(
            "sort N integers in place",
            "algo",
            "quicksort",
            vec![0.9, 0.44],
            Some(Outcome::new(true, 0.9, 700, "")),
        ),
        Pattern::new(
            "sort small list",
            "algo",
            "bubble",
            vec![0.5, 0.87],
            Some(Outcome::new(false, 0.2, 4000, "quadratic blowup")),
        ),
    ] {
        store.insert(pattern).await.unwrap();
    }
}

#[tokio::test]
async fn recommends_the_best_supported_strategy() {
    let store = MemoryPatternStore::new(SimilarityMetric::Cosine);
    seed_sorting_patterns(&store).await;
    let learner = learner_over(store);

    let rec = learner.recommend(&query(vec![1.0, 0.0])).await.unwrap();
    assert_eq!(rec.strategy, "mergesort");
    assert!(rec.confidence > 0.5, "confidence was {}", rec.confidence);
    assert!(!rec.supporting_pattern_ids.is_empty());
    assert!(rec.similarity_distribution.max <= 1.0);
    assert!(rec.similarity_distribution.min >= 0.5);
}

#[tokio::test]
async fn supporting_patterns_share_the_winning_strategy() {
    let store = MemoryPatternStore::new(SimilarityMetric::Cosine);
    seed_sorting_patterns(&store).await;
    let learner = learner_over(store);

    let rec = learner.recommend(&query(vec![1.0, 0.0])).await.unwrap();
    for id in &rec.supporting_pattern_ids {
        let pattern = learner.store().get(*id).await.unwrap();
        assert_eq!(pattern.strategy, rec.strategy);
    }
}

#[tokio::test]
async fn empty_store_falls_back_to_default() {
    let learner = learner_over(MemoryPatternStore::new(SimilarityMetric::Cosine));
    let rec = learner.recommend(&query(vec![1.0, 0.0])).await.unwrap();
    assert_eq!(rec.strategy, "noop");
    assert_eq!(rec.confidence, 0.0);
    assert!(rec.supporting_pattern_ids.is_empty());
}

#[tokio::test]
async fn k_zero_falls_back_to_default() {
    let store = MemoryPatternStore::new(SimilarityMetric::Cosine);
    seed_sorting_patterns(&store).await;
    let learner = learner_over(store);

    let mut q = query(vec![1.0, 0.0]);
    q.k = Some(0);
    let rec = learner.recommend(&q).await.unwrap();
    assert_eq!(rec.strategy, "noop");
    assert_eq!(rec.confidence, 0.0);
    assert!(rec.supporting_pattern_ids.is_empty());
}

#[tokio::test]
async fn zero_vector_query_falls_back_to_default() {
    let store = MemoryPatternStore::new(SimilarityMetric::Cosine);
    seed_sorting_patterns(&store).await;
    let learner = learner_over(store);

    let rec = learner.recommend(&query(vec![0.0, 0.0])).await.unwrap();
    assert_eq!(rec.strategy, "noop");
    assert_eq!(rec.confidence, 0.0);
}

#[tokio::test]
async fn recommendation_is_deterministic() {
    let store = MemoryPatternStore::new(SimilarityMetric::Cosine);
    seed_sorting_patterns(&store).await;
    let learner = learner_over(store);

    let first = learner.recommend(&query(vec![1.0, 0.0])).await.unwrap();
    for _ in 0..5 {
        let again = learner.recommend(&query(vec![1.0, 0.0])).await.unwrap();
        assert_eq!(first, again);
    }
}

#[tokio::test]
async fn attaching_a_failure_lowers_confidence() {
    let store = MemoryPatternStore::new(SimilarityMetric::Cosine);
    let pattern = Pattern::new("sort", "algo", "heapsort", vec![1.0, 0.0], None);
    let id = store.insert(pattern).await.unwrap();
    let learner = learner_over(store);

    let before = learner.recommend(&query(vec![1.0, 0.0])).await.unwrap();
    assert_eq!(before.strategy, "heapsort");
    assert!(before.confidence > 0.0);

    learner
        .observe_outcome(id, Outcome::new(false, 0.1, 5000, "thrashed"))
        .await
        .unwrap();

    let after = learner.recommend(&query(vec![1.0, 0.0])).await.unwrap();
    assert!(
        after.confidence < before.confidence,
        "expected {} < {}",
        after.confidence,
        before.confidence
    );

    let stats = learner.store().strategy_stats("algo").await.unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].strategy, "heapsort");
    assert_eq!(stats[0].count, 1);
    assert_eq!(stats[0].success_rate, 0.0);
}

#[tokio::test]
async fn min_similarity_floor_is_inclusive() {
    let store = MemoryPatternStore::new(SimilarityMetric::Cosine);
    store
        .insert(Pattern::new("t", "algo", "s", vec![1.0, 0.0], None))
        .await
        .unwrap();
    let learner = learner_over(store);

    let mut q = query(vec![1.0, 0.0]);
    q.min_similarity = Some(1.0);
    let rec = learner.recommend(&q).await.unwrap();
    // Similarity is exactly 1.0 and the floor is >=, so the neighbor counts.
    assert_eq!(rec.strategy, "s");
}

#[tokio::test]
async fn observe_inserts_or_attaches() {
    let store = MemoryPatternStore::new(SimilarityMetric::Cosine);
    let learner = learner_over(store);

    let bare = Pattern::new("t", "algo", "s", vec![1.0, 0.0], None);
    let id = learner.observe(bare.clone()).await.unwrap();
    assert!(learner.store().get(id).await.unwrap().outcome.is_none());

    // Same content arriving again, now with an outcome: attaches.
    let mut with_outcome = bare.clone();
    with_outcome.outcome = Some(Outcome::new(true, 0.8, 10, ""));
    let same_id = learner.observe(with_outcome).await.unwrap();
    assert_eq!(id, same_id);
    assert!(learner.store().get(id).await.unwrap().outcome.is_some());

    // And once more: the attached outcome is immutable.
    let mut conflicting = bare;
    conflicting.outcome = Some(Outcome::new(false, 0.1, 10, ""));
    learner.observe(conflicting).await.unwrap();
    assert!(learner.store().get(id).await.unwrap().outcome.unwrap().success);
}

#[tokio::test]
async fn dimension_mismatch_is_rejected() {
    let store = MemoryPatternStore::new(SimilarityMetric::Cosine);
    store
        .insert(Pattern::new("t", "algo", "s", vec![1.0, 0.0], None))
        .await
        .unwrap();
    let learner = learner_over(store);

    let err = learner.recommend(&query(vec![1.0, 0.0, 0.0])).await.unwrap_err();
    assert!(matches!(
        err,
        crate::Error::DimensionMismatch { expected: 2, actual: 3 }
    ));
}
