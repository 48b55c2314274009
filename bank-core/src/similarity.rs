//! Pure similarity kernel over embedding vectors.
//!
//! Deterministic, side-effect-free, and never suspends; callers on hot
//! paths may invoke it while holding locks.

use serde::{Deserialize, Serialize};

/// Which similarity function the store and learner use.
///
/// Both metrics order "larger is more similar".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    /// Cosine of the angle between the vectors, clamped to `[-1, 1]`
    #[default]
    Cosine,
    /// Negated Euclidean (L2) distance
    EuclideanNeg,
}

/// Similarity between two vectors under the chosen metric.
///
/// Under cosine, zero-magnitude vectors yield 0 rather than NaN, and the
/// result is clamped to `[-1, 1]` against rounding drift. Length
/// mismatches yield the least-similar value for the metric; the store
/// validates dimensions before rows get here.
#[must_use]
pub fn similarity(a: &[f32], b: &[f32], metric: SimilarityMetric) -> f32 {
    match metric {
        SimilarityMetric::Cosine => cosine(a, b),
        SimilarityMetric::EuclideanNeg => euclidean_neg(a, b),
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return 0.0;
    }

    (dot / (magnitude_a * magnitude_b)).clamp(-1.0, 1.0)
}

fn euclidean_neg(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::NEG_INFINITY;
    }

    -a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

/// L2 norm of a vector; stores cache this per row so repeated cosine
/// scans skip one square root per candidate.
#[must_use]
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((similarity(&v, &v, SimilarityMetric::Cosine) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(similarity(&a, &b, SimilarityMetric::Cosine).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_opposite_vectors_is_minus_one() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![-1.0, -2.0, -3.0];
        assert!((similarity(&a, &b, SimilarityMetric::Cosine) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn zero_vector_is_never_nan() {
        let zero = vec![0.0, 0.0, 0.0];
        let v = vec![1.0, 2.0, 3.0];
        let score = similarity(&zero, &v, SimilarityMetric::Cosine);
        assert_eq!(score, 0.0);
        assert!(!score.is_nan());
    }

    #[test]
    fn cosine_stays_clamped() {
        // Large magnitudes can push the quotient past 1.0 in f32
        let a = vec![1e20, 1e20];
        let b = vec![1e20, 1e20];
        let score = similarity(&a, &b, SimilarityMetric::Cosine);
        assert!((-1.0..=1.0).contains(&score));
    }

    #[test]
    fn euclidean_neg_orders_closer_higher() {
        let origin = vec![0.0, 0.0];
        let near = vec![1.0, 0.0];
        let far = vec![3.0, 4.0];
        let near_score = similarity(&origin, &near, SimilarityMetric::EuclideanNeg);
        let far_score = similarity(&origin, &far, SimilarityMetric::EuclideanNeg);
        assert!(near_score > far_score);
        assert!((far_score + 5.0).abs() < 1e-6);
    }

    #[test]
    fn identical_vectors_have_zero_euclidean_distance() {
        let v = vec![1.5, -2.5];
        assert_eq!(similarity(&v, &v, SimilarityMetric::EuclideanNeg), 0.0);
    }

    #[test]
    fn kernel_is_deterministic() {
        let a = vec![0.3, -0.9, 0.27];
        let b = vec![0.31, -0.88, 0.2];
        let first = similarity(&a, &b, SimilarityMetric::Cosine);
        for _ in 0..10 {
            assert_eq!(first, similarity(&a, &b, SimilarityMetric::Cosine));
        }
    }

    proptest::proptest! {
        #[test]
        fn cosine_is_symmetric_bounded_and_finite(
            pairs in proptest::collection::vec((-100.0f32..100.0, -100.0f32..100.0), 1..32)
        ) {
            let (a, b): (Vec<f32>, Vec<f32>) = pairs.into_iter().unzip();
            let ab = similarity(&a, &b, SimilarityMetric::Cosine);
            let ba = similarity(&b, &a, SimilarityMetric::Cosine);
            proptest::prop_assert_eq!(ab, ba);
            proptest::prop_assert!((-1.0..=1.0).contains(&ab));
            proptest::prop_assert!(!ab.is_nan());
        }
    }
}
