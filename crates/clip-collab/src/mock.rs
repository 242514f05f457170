//! Deterministic embedder that needs no model files.

use async_trait::async_trait;

use clip_core::{Embedder, Result};

/// Hash-seeded pseudo-embedding: identical text always yields the identical
/// unit vector. Useful as the default backend and in tests.
pub struct HashEmbedder {
    dimension: usize,
    model_id: String,
}

impl HashEmbedder {
    /// Create a new hash embedder with the default dimension.
    pub fn new() -> Self {
        Self::with_dimension(384)
    }

    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension,
            model_id: format!("hash-{}", dimension),
        }
    }

    fn vector(&self, text: &str) -> Vec<f32> {
        let mut reader = blake3::Hasher::new()
            .update(text.trim().as_bytes())
            .finalize_xof();

        let mut bytes = vec![0u8; self.dimension * 4];
        reader.fill(&mut bytes);

        let embedding: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| {
                let n = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                (n as f32 / u32::MAX as f32) - 0.5
            })
            .collect();

        l2_normalize(embedding)
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vector(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// L2 normalize a vector.
pub(crate) fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}
