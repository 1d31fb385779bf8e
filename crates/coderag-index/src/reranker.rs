//! Cross-encoder reranking of the top search results.
//!
//! The reranking service scores `(query, code)` pairs jointly, which is
//! more precise than comparing embeddings. It is optional: callers keep
//! their own ordering whenever it fails.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use coderag_config::CrossEncoderConfig;

use crate::search::SearchResult;

/// Trait for reordering search results.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Return `candidates` reordered by relevance to `query`. Every input
    /// result appears exactly once in the output.
    async fn rerank(
        &self,
        query: &str,
        candidates: &[SearchResult],
        top_k: usize,
    ) -> Result<Vec<SearchResult>>;
}

#[derive(Serialize)]
struct CodeCandidate<'a> {
    code: &'a str,
    file_path: &'a str,
    score: f32,
    language: &'a str,
    #[serde(rename = "type")]
    chunk_type: &'a str,
    name: &'a str,
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    candidates: Vec<CodeCandidate<'a>>,
    top_k: usize,
    use_cache: bool,
}

#[derive(Debug, Deserialize)]
struct RerankedItem {
    file_path: String,
    code: String,
    #[serde(default)]
    original_score: f32,
    #[serde(default)]
    cross_encoder_score: f32,
    final_score: f32,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankedItem>,
    #[serde(default)]
    rerank_time_ms: f64,
    #[serde(default)]
    cache_hit: bool,
}

/// HTTP client for the cross-encoder reranking service.
pub struct CrossEncoderReranker {
    client: Client,
    url: String,
}

impl CrossEncoderReranker {
    pub fn new(url: String, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, url }
    }

    pub fn from_config(config: &CrossEncoderConfig) -> Self {
        Self::new(config.url.clone(), Duration::from_secs(config.timeout_secs.max(1)))
    }

    fn health_url(&self) -> String {
        let base = self.url.trim_end_matches('/');
        let base = base.strip_suffix("/rerank").unwrap_or(base);
        format!("{}/health", base)
    }

    /// Whether the service answers its health endpoint.
    pub async fn health(&self) -> bool {
        match self.client.get(self.health_url()).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Put `candidates` in the order of `reranked`, matching on
/// `(file_path, code)` so line numbers and ids survive. Candidates the
/// service did not return follow in their original order.
fn apply_ranking(candidates: &[SearchResult], reranked: Vec<RerankedItem>) -> Vec<SearchResult> {
    let mut by_key: HashMap<(&str, &str), VecDeque<usize>> = HashMap::new();
    for (i, c) in candidates.iter().enumerate() {
        by_key
            .entry((c.file_path.as_str(), c.code.as_str()))
            .or_default()
            .push_back(i);
    }

    let mut used = vec![false; candidates.len()];
    let mut ordered = Vec::with_capacity(candidates.len());

    for item in &reranked {
        let slot = by_key
            .get_mut(&(item.file_path.as_str(), item.code.as_str()))
            .and_then(|q| q.pop_front());
        if let Some(i) = slot {
            used[i] = true;
            let mut result = candidates[i].clone();
            result.score = item.final_score;
            ordered.push(result);
        }
    }

    ordered.extend(
        candidates
            .iter()
            .zip(&used)
            .filter(|(_, &u)| !u)
            .map(|(c, _)| c.clone()),
    );
    ordered
}

#[async_trait]
impl Reranker for CrossEncoderReranker {
    async fn rerank(
        &self,
        query: &str,
        candidates: &[SearchResult],
        top_k: usize,
    ) -> Result<Vec<SearchResult>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let request = RerankRequest {
            query,
            candidates: candidates
                .iter()
                .map(|c| CodeCandidate {
                    code: &c.code,
                    file_path: &c.file_path,
                    score: c.score,
                    language: &c.language,
                    chunk_type: &c.chunk_type,
                    name: &c.name,
                })
                .collect(),
            top_k,
            use_cache: true,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .context("Cross-encoder request failed")?
            .error_for_status()
            .context("Cross-encoder returned an error status")?;

        let parsed: RerankResponse = response
            .json()
            .await
            .context("Failed to parse cross-encoder response")?;

        debug!(
            candidates = candidates.len(),
            returned = parsed.results.len(),
            rerank_time_ms = parsed.rerank_time_ms,
            cache_hit = parsed.cache_hit,
            top_original = parsed.results.first().map(|r| r.original_score),
            top_cross_encoder = parsed.results.first().map(|r| r.cross_encoder_score),
            "Cross-encoder reranked results"
        );

        Ok(apply_ranking(candidates, parsed.results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(path: &str, code: &str, line: usize, score: f32) -> SearchResult {
        SearchResult {
            id: format!("{}:{}", path, line),
            file_path: path.to_string(),
            code: code.to_string(),
            language: "go".to_string(),
            score,
            line_start: line,
            line_end: line + 1,
            repository: String::new(),
            chunk_type: "function".to_string(),
            name: String::new(),
        }
    }

    fn item(path: &str, code: &str, score: f32) -> RerankedItem {
        RerankedItem {
            file_path: path.to_string(),
            code: code.to_string(),
            original_score: 0.0,
            cross_encoder_score: score,
            final_score: score,
        }
    }

    #[test]
    fn test_apply_ranking_preserves_lines_and_ids() {
        let candidates = vec![
            result("a.go", "func A() {}", 1, 0.9),
            result("b.go", "func B() {}", 10, 0.8),
            result("c.go", "func C() {}", 20, 0.7),
        ];
        let ordered = apply_ranking(
            &candidates,
            vec![item("c.go", "func C() {}", 0.99), item("a.go", "func A() {}", 0.5)],
        );

        let ids: Vec<&str> = ordered.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c.go:20", "a.go:1", "b.go:10"]);
        assert_eq!(ordered[0].line_start, 20);
        assert!((ordered[0].score - 0.99).abs() < 1e-6);
        assert!((ordered[2].score - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_apply_ranking_ignores_unknown_and_duplicates() {
        let candidates = vec![
            result("a.go", "same", 1, 0.9),
            result("a.go", "same", 5, 0.8),
        ];
        let ordered = apply_ranking(
            &candidates,
            vec![
                item("zz.go", "unknown", 1.0),
                item("a.go", "same", 0.7),
                item("a.go", "same", 0.6),
                item("a.go", "same", 0.5),
            ],
        );
        assert_eq!(ordered.len(), 2);
        assert_eq!(ordered[0].line_start, 1);
        assert_eq!(ordered[1].line_start, 5);
    }

    #[test]
    fn test_health_url() {
        let r = CrossEncoderReranker::new(
            "http://localhost:8002/rerank".to_string(),
            Duration::from_secs(1),
        );
        assert_eq!(r.health_url(), "http://localhost:8002/health");
    }

    #[tokio::test]
    async fn test_unreachable_service_errors() {
        let r = CrossEncoderReranker::new(
            "http://127.0.0.1:9/rerank".to_string(),
            Duration::from_secs(1),
        );
        assert!(!r.health().await);
        let candidates = vec![result("a.go", "func A() {}", 1, 0.9)];
        assert!(r.rerank("a", &candidates, 1).await.is_err());
    }

    #[test]
    fn test_response_parsing() {
        let json = r#"{"results":[{"file_path":"a.go","code":"x","language":"go","type":"function","name":"A","original_score":0.5,"cross_encoder_score":0.9,"final_score":0.8}],"rerank_time_ms":12.5,"cache_hit":false}"#;
        let parsed: RerankResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.results.len(), 1);
        assert!((parsed.results[0].final_score - 0.8).abs() < 1e-6);
    }
}
