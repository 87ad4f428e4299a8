//! The embedding backend — an external collaborator (spec.md §1).
//!
//! ENGRAM never bundles a model runtime. Callers implement [`Embedder`] over
//! whatever local or remote embedding service they run and hand it to the
//! [`crate::orchestrator::Orchestrator`]; every vector produced by one
//! `Embedder` instance must share a single fixed dimension (spec.md §3,
//! invariant 4).

/// Text-to-vector backend.
pub trait Embedder: Send + Sync {
    /// Embed a single piece of text.
    fn embed(&self, text: &str) -> Vec<f32>;

    /// Embed a batch of texts. The default implementation calls [`Self::embed`]
    /// once per item; implementations backed by a batching API should
    /// override this.
    fn embed_batch(&self, texts: &[&str]) -> Vec<Vec<f32>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// The fixed dimension of vectors this embedder produces.
    fn dimension(&self) -> usize;
}

/// Cosine similarity between two vectors of equal length. Returns `0.0` if
/// either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
