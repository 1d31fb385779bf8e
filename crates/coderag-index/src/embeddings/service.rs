//! Client for a local embedding microservice.
//!
//! The service accepts `POST /embed` with `{texts, model}` and answers
//! `{embeddings, model, dimension}`; `GET /health` reports readiness.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{validate_batch, EmbeddingError, EmbeddingProvider};

#[derive(Serialize)]
struct ServiceRequest<'a> {
    texts: &'a [String],
    model: &'a str,
}

#[derive(Deserialize)]
struct ServiceResponse {
    embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    dimension: Option<usize>,
}

/// Embedding provider backed by the HTTP embedding service.
pub struct ServiceEmbeddings {
    base_url: String,
    model: String,
    dimensions: usize,
    client: Client,
}

impl ServiceEmbeddings {
    pub fn new(base_url: String, model: String, dimensions: usize, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            dimensions,
            client,
        }
    }

    /// Whether the service answers its health endpoint.
    pub async fn health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(url = %url, error = %e, "Embedding service health check failed");
                false
            }
        }
    }
}

#[async_trait]
impl EmbeddingProvider for ServiceEmbeddings {
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

        let url = format!("{}/embed", self.base_url);
        debug!(count = texts.len(), url = %url, "Sending embedding service request");

        let response = self
            .client
            .post(&url)
            .json(&ServiceRequest {
                texts,
                model: &self.model,
            })
            .send()
            .await
            .map_err(|e| EmbeddingError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::ApiError(format!("{}: {}", status.as_u16(), body)).into());
        }

        let parsed: ServiceResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;

        if let Some(dimension) = parsed.dimension {
            if dimension != self.dimensions {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: self.dimensions,
                    got: dimension,
                }
                .into());
            }
        }
        debug!(model = ?parsed.model, "Embedding service responded");

        validate_batch(&parsed.embeddings, texts.len(), self.dimensions)?;
        Ok(parsed.embeddings)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
