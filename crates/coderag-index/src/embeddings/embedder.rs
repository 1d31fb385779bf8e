//! Cached embedding front-end used by the indexer and the searcher.

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use super::{validate_batch, EmbeddingCache, EmbeddingCacheStats, EmbeddingProvider};

/// Wraps a provider with the shared embedding cache and request batching.
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    cache: EmbeddingCache,
    batch_size: usize,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, cache_size: usize, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1).min(provider.max_batch_size().max(1));
        Self {
            provider,
            cache: EmbeddingCache::new(cache_size),
            batch_size,
        }
    }

    /// Text sent to the provider for a code fragment.
    pub fn code_text(code: &str, language: &str) -> String {
        format!("[{}]\n{}", language, code)
    }

    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[query.to_string()]).await?;
        Ok(vectors.pop().unwrap_or_default())
    }

    pub async fn embed_code(&self, code: &str, language: &str) -> Result<Vec<f32>> {
        self.embed_query(&Self::code_text(code, language)).await
    }

    /// Embed `(code, language)` pairs, preserving input order.
    pub async fn embed_code_batch(&self, items: &[(String, String)]) -> Result<Vec<Vec<f32>>> {
        let texts: Vec<String> = items
            .iter()
            .map(|(code, lang)| Self::code_text(code, lang))
            .collect();
        self.embed_batch(&texts).await
    }

    /// Embed raw texts. Cached texts are served from the cache and only the
    /// misses are sent to the provider, in slices of `batch_size`.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut missing: Vec<usize> = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            match self.cache.get(text) {
                Some(hit) => results.push(Some(hit.as_ref().clone())),
                None => {
                    results.push(None);
                    missing.push(i);
                }
            }
        }

        if !missing.is_empty() {
            debug!(
                total = texts.len(),
                cached = texts.len() - missing.len(),
                "Embedding cache misses sent to provider"
            );
        }

        for slice in missing.chunks(self.batch_size) {
            let batch: Vec<String> = slice.iter().map(|&i| texts[i].clone()).collect();
            let vectors = self.provider.embed_batch(&batch).await?;
            validate_batch(&vectors, batch.len(), self.provider.dimensions())?;

            for (&i, vector) in slice.iter().zip(vectors) {
                self.cache.insert(&texts[i], vector.clone());
                results[i] = Some(vector);
            }
        }

        Ok(results.into_iter().map(|v| v.unwrap_or_default()).collect())
    }

    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn fallback_count(&self) -> u64 {
        self.provider.fallback_count()
    }

    pub fn cache_stats(&self) -> EmbeddingCacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}
