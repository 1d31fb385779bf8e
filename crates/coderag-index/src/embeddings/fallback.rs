//! Degraded-mode wrapper around a primary embedding provider.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

use super::{validate_batch, EmbeddingProvider, HashEmbeddings};

/// Serves hash embeddings whenever the primary provider errors, times out
/// or returns malformed vectors. Every degraded request is counted.
pub struct FallbackEmbeddings {
    primary: Arc<dyn EmbeddingProvider>,
    fallback: HashEmbeddings,
    timeout: Duration,
    fallbacks: AtomicU64,
}

impl FallbackEmbeddings {
    pub fn new(primary: Arc<dyn EmbeddingProvider>, timeout: Duration) -> Self {
        let fallback = HashEmbeddings::new(primary.dimensions());
        Self {
            primary,
            fallback,
            timeout,
            fallbacks: AtomicU64::new(0),
        }
    }

    fn degrade(&self, count: usize, reason: &str) {
        let total = self.fallbacks.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            model = self.primary.model_name(),
            texts = count,
            reason,
            total_fallbacks = total,
            "Embedding provider unavailable, using hash embeddings"
        );
    }
}

#[async_trait]
impl EmbeddingProvider for FallbackEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut batch = self.embed_batch(&[text.to_string()]).await?;
        Ok(batch.pop().unwrap_or_else(|| self.fallback.embed_text(text)))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        match tokio::time::timeout(self.timeout, self.primary.embed_batch(texts)).await {
            Ok(Ok(vectors)) => match validate_batch(&vectors, texts.len(), self.dimensions()) {
                Ok(()) => return Ok(vectors),
                Err(e) => self.degrade(texts.len(), &e.to_string()),
            },
            Ok(Err(e)) => self.degrade(texts.len(), &e.to_string()),
            Err(_) => self.degrade(texts.len(), "timeout"),
        }

        Ok(texts.iter().map(|t| self.fallback.embed_text(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.primary.dimensions()
    }

    fn model_name(&self) -> &str {
        self.primary.model_name()
    }

    fn max_batch_size(&self) -> usize {
        self.primary.max_batch_size()
    }

    fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }
}
