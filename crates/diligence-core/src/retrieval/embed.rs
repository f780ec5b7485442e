//! Query embedding.
//!
//! The adapter embeds query terms before searching the vector index, so the
//! index is queried by vector whenever an [`Embedder`] is configured.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{tokenize, RetrievalResult};

/// Turns text into a vector in the same space as the indexed chunks.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> RetrievalResult<Vec<f32>>;

    /// Length of the vectors this embedder produces.
    fn dimensions(&self) -> usize;
}

/// Local embedder over hashed terms.
///
/// Each term of the text is hashed into one of `dimensions` buckets and the
/// bucket counts are L2-normalised. Needs no model, so corpora without
/// precomputed embeddings can still be searched by vector.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub const DEFAULT_DIMENSIONS: usize = 1024;

    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for term in tokenize(text) {
            vector[self.bucket(&term)] += 1.0;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }

    fn bucket(&self, term: &str) -> usize {
        let digest = Sha256::digest(term.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(head) % self.dimensions as u64) as usize
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMENSIONS)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> RetrievalResult<Vec<f32>> {
        Ok(self.embed_text(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
