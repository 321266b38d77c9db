//! Embedding model trait and vector utilities.
//!
//! Defines the [`EmbeddingModel`] trait that all embedding backends
//! implement, plus pure helper functions for similarity, averaging and
//! normalization.
//!
//! Concrete model implementations (HTTP, local CLIP via fastembed) live in
//! the `profile-fusion` app crate.

use async_trait::async_trait;

use crate::error::Result;

/// A joint image/text embedding model.
///
/// Text and images must land in the same space (CLIP-style) so that a
/// text query can be compared against image-derived profile components.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Returns the model identifier (e.g. `"clip-vit-b-32"`).
    fn model_name(&self) -> &str;
    /// Returns the raw embedding dimensionality before any reduction.
    fn dims(&self) -> usize;
    /// Embed one piece of text.
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>>;
    /// Embed one encoded image (JPEG, PNG, ...).
    async fn embed_image(&self, image: &[u8]) -> Result<Vec<f32>>;
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`:
/// - `1.0` = identical direction
/// - `0.0` = orthogonal (unrelated)
/// - `-1.0` = opposite direction
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Euclidean norm.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scale `v` to unit length in place.
///
/// Returns `false` and leaves `v` untouched when its norm is zero.
pub fn l2_normalize(v: &mut [f32]) -> bool {
    let norm = l2_norm(v);
    if norm < f32::EPSILON {
        return false;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    true
}

/// Element-wise mean of equally sized vectors.
///
/// Returns `None` for an empty input. Callers are expected to have checked
/// dimensions already; extra trailing elements of longer vectors are ignored.
pub fn mean(vectors: &[&[f32]]) -> Option<Vec<f32>> {
    let first = vectors.first()?;
    let mut acc = vec![0.0f32; first.len()];
    for v in vectors {
        for (a, x) in acc.iter_mut().zip(v.iter()) {
            *a += x;
        }
    }
    let n = vectors.len() as f32;
    for a in acc.iter_mut() {
        *a /= n;
    }
    Some(acc)
}
