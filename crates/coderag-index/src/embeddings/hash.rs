//! Deterministic embeddings derived from token hashes.
//!
//! Each token is hashed into a signed bucket of the output vector, then
//! the vector is L2-normalised. Texts sharing vocabulary land close
//! together, which keeps search usable without a model server.

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::EmbeddingProvider;
use crate::tokens::code_tokens;

/// Token-hashing embedding provider. Needs no network.
#[derive(Debug, Clone)]
pub struct HashEmbeddings {
    dimensions: usize,
}

impl HashEmbeddings {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    /// Embed synchronously.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];

        let tokens = code_tokens(text);
        if tokens.is_empty() {
            self.add_token(&mut vector, "<empty>", 1.0);
        }
        for token in &tokens {
            self.add_token(&mut vector, token, 1.0);
        }
        // Adjacent pairs carry a little word-order signal
        for pair in tokens.windows(2) {
            self.add_token(&mut vector, &format!("{} {}", pair[0], pair[1]), 0.5);
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }

    fn add_token(&self, vector: &mut [f32], token: &str, weight: f32) {
        let digest = Sha256::digest(token.as_bytes());
        let mut bucket = [0u8; 8];
        bucket.copy_from_slice(&digest[..8]);
        let index = (u64::from_le_bytes(bucket) % self.dimensions as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign * weight;
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_text(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        "hash"
    }

    fn max_batch_size(&self) -> usize {
        256
    }
}
