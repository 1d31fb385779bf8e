//! Embedding provider trait and implementations.
//!
//! This module defines the interface for generating embeddings
//! and provides implementations for the supported embedding backends.

pub mod cache;
pub mod embedder;
pub mod fallback;
pub mod hash;
pub mod service;

pub use cache::{EmbeddingCache, EmbeddingCacheStats};
pub use embedder::Embedder;
pub use fallback::FallbackEmbeddings;
pub use hash::HashEmbeddings;
pub use service::ServiceEmbeddings;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use coderag_config::{EmbeddingConfig, EmbeddingProviderKind};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur during embedding generation.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("API request failed: {0}")]
    ApiError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Rate limited after {0} retries")]
    RateLimited(u32),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Expected {expected} embeddings, got {got}")]
    CountMismatch { expected: usize, got: usize },

    #[error("Expected {expected} dimensions, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Trait for embedding providers.
///
/// Implementations should be Send + Sync to allow use in async contexts.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed multiple texts in a batch
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Get the number of dimensions
    fn dimensions(&self) -> usize;

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Get the maximum batch size supported.
    fn max_batch_size(&self) -> usize {
        32
    }

    /// Number of requests served by a degraded path, if the provider has one.
    fn fallback_count(&self) -> u64 {
        0
    }
}

/// Build the provider described by `config`, wrapped in the hash fallback
/// when `fallback_to_hash` is set.
pub fn provider_from_config(config: &EmbeddingConfig) -> Arc<dyn EmbeddingProvider> {
    let timeout = Duration::from_secs(config.timeout_secs.max(1));
    let primary: Arc<dyn EmbeddingProvider> = match config.provider {
        EmbeddingProviderKind::Hash => {
            return Arc::new(HashEmbeddings::new(config.dimensions));
        }
        EmbeddingProviderKind::Service => Arc::new(ServiceEmbeddings::new(
            config.url.clone(),
            config.model.clone(),
            config.dimensions,
            timeout,
        )),
        EmbeddingProviderKind::OpenAi => {
            let provider = OpenAiEmbeddings::new(
                config.api_key.clone().unwrap_or_default(),
                Some(config.model.clone()),
                Some(config.dimensions),
            )
            .with_base_url(config.url.clone());
            Arc::new(provider)
        }
    };

    info!(
        model = primary.model_name(),
        dimensions = primary.dimensions(),
        fallback = config.fallback_to_hash,
        "Embedding provider configured"
    );

    if config.fallback_to_hash {
        Arc::new(FallbackEmbeddings::new(primary, timeout))
    } else {
        primary
    }
}

/// Check that a provider returned one vector of the right size per input.
pub(crate) fn validate_batch(
    vectors: &[Vec<f32>],
    expected_count: usize,
    dimensions: usize,
) -> Result<(), EmbeddingError> {
    if vectors.len() != expected_count {
        return Err(EmbeddingError::CountMismatch {
            expected: expected_count,
            got: vectors.len(),
        });
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dimensions) {
        return Err(EmbeddingError::DimensionMismatch {
            expected: dimensions,
            got: bad.len(),
        });
    }
    Ok(())
}

/// Request body for embedding API
#[derive(Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

/// Response from embedding API
#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

/// Individual embedding data in response
#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// Embedding provider for OpenAI-compatible `/v1/embeddings` endpoints.
pub struct OpenAiEmbeddings {
    api_key: String,
    model: String,
    dimensions: usize,
    client: Client,
    base_url: String,
}

impl OpenAiEmbeddings {
    /// Create a new provider. Defaults to `text-embedding-3-small` (1536 dimensions).
    pub fn new(api_key: String, model: Option<String>, dimensions: Option<usize>) -> Self {
        Self {
            api_key,
            model: model.unwrap_or_else(|| "text-embedding-3-small".to_string()),
            dimensions: dimensions.unwrap_or(1536),
            client: Client::new(),
            base_url: "https://api.openai.com/v1/embeddings".to_string(),
        }
    }

    /// Set a custom endpoint. A bare host gets `/v1/embeddings` appended.
    pub fn with_base_url(mut self, url: String) -> Self {
        let url = url.trim_end_matches('/').to_string();
        self.base_url = if url.ends_with("/embeddings") {
            url
        } else {
            format!("{}/v1/embeddings", url)
        };
        self
    }

    /// Send embedding request with retry logic for rate limits.
    async fn send_request(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let expected = texts.len();
        let request_body = EmbeddingRequest {
            model: self.model.clone(),
            input: texts,
        };

        let mut retry_count = 0;
        let max_retries = 3;
        let mut backoff_secs = 1u64;

        loop {
            debug!(
                count = expected,
                url = %self.base_url,
                "Sending embedding request"
            );

            let response = self
                .client
                .post(&self.base_url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&request_body)
                .send()
                .await
                .map_err(|e| EmbeddingError::NetworkError(e.to_string()))?;

            let status = response.status();

            if status.is_success() {
                let embedding_response: EmbeddingResponse = response
                    .json()
                    .await
                    .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;

                // Sort by index to ensure correct order
                let mut embeddings: Vec<(usize, Vec<f32>)> = embedding_response
                    .data
                    .into_iter()
                    .map(|d| (d.index, d.embedding))
                    .collect();
                embeddings.sort_by_key(|(idx, _)| *idx);

                let vectors: Vec<Vec<f32>> = embeddings.into_iter().map(|(_, emb)| emb).collect();
                validate_batch(&vectors, expected, self.dimensions)?;
                return Ok(vectors);
            }

            if status.as_u16() == 429 {
                retry_count += 1;
                if retry_count > max_retries {
                    return Err(EmbeddingError::RateLimited(max_retries).into());
                }

                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(backoff_secs);

                warn!(
                    retry_after,
                    attempt = retry_count,
                    max_retries,
                    "Embedding API rate limited, retrying"
                );

                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                backoff_secs *= 2;
                continue;
            }

            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(EmbeddingError::ApiError(format!(
                "{}: {}",
                status.as_u16(),
                error_body
            ))
            .into());
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embeddings = self.embed_batch(&[text.to_string()]).await?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::InvalidResponse("no embedding returned".into()).into())
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        self.send_request(texts.to_vec()).await
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn max_batch_size(&self) -> usize {
        64
    }
}
