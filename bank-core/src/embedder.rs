//! Caller-supplied embedding contract.
//!
//! The bank never trains or ships an embedding model; vectors either
//! arrive precomputed or come from an [`Embedder`] the caller plugs in.

/// Opaque function turning a task description into a fixed-length vector.
///
/// Implementations must be deterministic for a given input and always
/// return vectors of [`Embedder::dimension`] length.
pub trait Embedder: Send + Sync {
    /// Embed one task description.
    fn embed(&self, text: &str) -> Vec<f32>;

    /// Length of every vector this embedder produces.
    fn dimension(&self) -> usize;
}
