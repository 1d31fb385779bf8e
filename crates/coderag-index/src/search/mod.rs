//! Hybrid search combining vector similarity and keyword matching.
//!
//! Semantic and keyword candidates are merged with Reciprocal Rank Fusion
//! (RRF), deduplicated by location, boosted by the analysed query intent
//! and by path/name heuristics, and optionally reordered by a
//! cross-encoder.

pub mod bm25;
pub mod expand;
pub mod query;
pub mod rerank;

pub use bm25::BM25Index;
pub use expand::expand_query;
pub use query::{analyze_query, apply_intent, EntityType, QueryIntent, SearchType};
pub use rerank::{heuristic_rerank, normalize_score};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use coderag_config::SearchSettings;

use crate::embeddings::Embedder;
use crate::keyword::KeywordIndex;
use crate::reranker::Reranker;
use crate::store::{PointPayload, SearchFilter, VectorHit, VectorStore};

/// A search result with relevance score and location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Chunk id, shared by the vector and keyword stores
    pub id: String,
    pub file_path: String,
    pub code: String,
    pub language: String,
    /// Relevance score (higher is better)
    pub score: f32,
    pub line_start: usize,
    pub line_end: usize,
    pub repository: String,
    /// Kind of code element (function, method, type, ...)
    #[serde(rename = "type")]
    pub chunk_type: String,
    pub name: String,
}

impl SearchResult {
    /// `path:start-end`, the deduplication key.
    pub fn location_key(&self) -> String {
        format!("{}:{}-{}", self.file_path, self.line_start, self.line_end)
    }

    fn payload(&self) -> PointPayload {
        PointPayload {
            file_path: self.file_path.clone(),
            code: String::new(),
            language: self.language.clone(),
            chunk_type: self.chunk_type.clone(),
            name: self.name.clone(),
            line_start: self.line_start,
            line_end: self.line_end,
            repository: self.repository.clone(),
            signature: None,
        }
    }
}

impl From<VectorHit> for SearchResult {
    fn from(hit: VectorHit) -> Self {
        let p = hit.payload;
        Self {
            id: hit.id,
            file_path: p.file_path,
            code: p.code,
            language: p.language,
            score: hit.score,
            line_start: p.line_start,
            line_end: p.line_end,
            repository: p.repository,
            chunk_type: p.chunk_type,
            name: p.name,
        }
    }
}

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Semantic search failed and no keyword results are available: {0}")]
    Unavailable(String),
}

/// Configuration for hybrid search.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// RRF k parameter (default 60)
    pub rrf_k: f32,
    pub semantic_weight: f32,
    pub keyword_weight: f32,
    /// Each path fetches `limit * candidate_multiplier` candidates
    pub candidate_multiplier: usize,
    pub rerank_top_n: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            rrf_k: 60.0,
            semantic_weight: 1.0,
            keyword_weight: 1.0,
            candidate_multiplier: 2,
            rerank_top_n: 20,
        }
    }
}

impl From<&SearchSettings> for SearchConfig {
    fn from(settings: &SearchSettings) -> Self {
        Self {
            rrf_k: settings.rrf_k,
            semantic_weight: settings.semantic_weight,
            keyword_weight: settings.keyword_weight,
            candidate_multiplier: settings.candidate_multiplier.max(1),
            rerank_top_n: settings.rerank_top_n,
        }
    }
}

/// Reciprocal Rank Fusion (RRF) implementation.
///
/// Combines rankings from multiple sources into a single ranking.
/// RRF score = sum(w_i / (k + rank_i + 1)) for each ranking source.
/// Results are identified by id; equal scores keep first-appearance order.
pub fn reciprocal_rank_fusion(rankings: &[(&[SearchResult], f32)], k: f32) -> Vec<SearchResult> {
    let mut scores: HashMap<&str, f32> = HashMap::new();
    let mut order: Vec<&SearchResult> = Vec::new();

    for (results, weight) in rankings {
        for (rank, result) in results.iter().enumerate() {
            let rrf_score = weight / (k + rank as f32 + 1.0);
            match scores.get_mut(result.id.as_str()) {
                Some(score) => *score += rrf_score,
                None => {
                    scores.insert(result.id.as_str(), rrf_score);
                    order.push(result);
                }
            }
        }
    }

    let mut fused: Vec<SearchResult> = order
        .into_iter()
        .map(|r| {
            let mut fused = r.clone();
            fused.score = scores.get(r.id.as_str()).copied().unwrap_or_default();
            fused
        })
        .collect();
    // Stable sort keeps first appearance for ties.
    fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    fused
}

/// Keep the first (highest ranked) result for each location.
pub fn dedup_by_location(results: Vec<SearchResult>) -> Vec<SearchResult> {
    let mut seen = HashSet::new();
    results
        .into_iter()
        .filter(|r| seen.insert(r.location_key()))
        .collect()
}

/// Hybrid searcher combining vector and keyword search.
pub struct HybridSearcher {
    config: SearchConfig,
    embedder: Arc<Embedder>,
    store: Arc<dyn VectorStore>,
    keyword: Option<Arc<dyn KeywordIndex>>,
    reranker: Option<Arc<dyn Reranker>>,
}

impl HybridSearcher {
    pub fn new(
        config: SearchConfig,
        embedder: Arc<Embedder>,
        store: Arc<dyn VectorStore>,
        keyword: Option<Arc<dyn KeywordIndex>>,
    ) -> Self {
        Self {
            config,
            embedder,
            store,
            keyword,
            reranker: None,
        }
    }

    /// Send the top results through a cross-encoder before truncation.
    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Search `collection` for code matching `query`.
    ///
    /// Fails only when the semantic path fails and the keyword index is
    /// missing or fails too. A keyword index with no hits yields an empty
    /// result.
    pub async fn search(
        &self,
        query: &str,
        collection: &str,
        limit: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<SearchResult>, SearchError> {
        if limit == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        debug!(query, collection, limit, "Hybrid search");

        let intent = analyze_query(query);
        let expanded = expand_query(query);
        let candidates = limit * self.config.candidate_multiplier.max(1);

        let (semantic, keyword) = tokio::join!(
            self.semantic_search(&expanded, collection, candidates, filter),
            async { self.keyword_search(query, collection, candidates, filter) }
        );

        let fused = match (semantic, keyword) {
            (Ok(semantic), Some(Ok(keyword))) => reciprocal_rank_fusion(
                &[
                    (semantic.as_slice(), self.config.semantic_weight),
                    (keyword.as_slice(), self.config.keyword_weight),
                ],
                self.config.rrf_k,
            ),
            (Ok(semantic), keyword) => {
                if let Some(Err(e)) = keyword {
                    warn!(error = %e, "Keyword search failed, using semantic results only");
                }
                reciprocal_rank_fusion(
                    &[(semantic.as_slice(), self.config.semantic_weight)],
                    self.config.rrf_k,
                )
            }
            (Err(e), Some(Ok(keyword))) => {
                warn!(
                    error = %e,
                    hits = keyword.len(),
                    "Semantic search failed, serving keyword results"
                );
                reciprocal_rank_fusion(
                    &[(keyword.as_slice(), self.config.keyword_weight)],
                    self.config.rrf_k,
                )
            }
            (Err(e), keyword) => {
                if let Some(Err(ke)) = keyword {
                    warn!(error = %ke, "Keyword search failed as well");
                }
                return Err(SearchError::Unavailable(format!("{:#}", e)));
            }
        };

        let results = dedup_by_location(fused);
        let results = apply_intent(&intent, results);
        let results = heuristic_rerank(results, query);
        let mut results = self.cross_encode(query, results).await;
        results.truncate(limit);

        debug!(returned = results.len(), "Hybrid search complete");
        Ok(results)
    }

    async fn semantic_search(
        &self,
        query: &str,
        collection: &str,
        limit: usize,
        filter: Option<&SearchFilter>,
    ) -> anyhow::Result<Vec<SearchResult>> {
        let vector = self.embedder.embed_query(query).await?;
        let hits = self.store.search(collection, &vector, limit, filter).await?;
        Ok(hits
            .into_iter()
            .map(|hit| {
                let mut result = SearchResult::from(hit);
                result.score = normalize_score(result.score);
                result
            })
            .collect())
    }

    fn keyword_search(
        &self,
        query: &str,
        collection: &str,
        limit: usize,
        filter: Option<&SearchFilter>,
    ) -> Option<Result<Vec<SearchResult>, crate::keyword::KeywordError>> {
        let keyword = self.keyword.as_ref()?;
        // Over-fetch when filtering so the limit still has a chance to fill.
        let fetch = match filter {
            Some(f) if !f.is_empty() => limit * 4,
            _ => limit,
        };
        Some(keyword.search(query, collection, fetch).map(|results| {
            let mut results: Vec<SearchResult> = match filter {
                Some(f) => results.into_iter().filter(|r| f.matches(&r.payload())).collect(),
                None => results,
            };
            results.truncate(limit);
            results
        }))
    }

    /// Rerank the head of the list with the cross-encoder, keeping the
    /// heuristic order on any failure.
    async fn cross_encode(&self, query: &str, mut results: Vec<SearchResult>) -> Vec<SearchResult> {
        let Some(ref reranker) = self.reranker else {
            return results;
        };
        let top_n = self.config.rerank_top_n.min(results.len());
        if top_n == 0 {
            return results;
        }

        let tail = results.split_off(top_n);
        match reranker.rerank(query, &results, top_n).await {
            Ok(mut reranked) if reranked.len() == results.len() => {
                reranked.extend(tail);
                reranked
            }
            Ok(reranked) => {
                warn!(
                    expected = results.len(),
                    got = reranked.len(),
                    "Cross-encoder returned a different number of results, keeping heuristic order"
                );
                results.extend(tail);
                results
            }
            Err(e) => {
                warn!(error = %e, "Cross-encoder rerank failed, keeping heuristic order");
                results.extend(tail);
                results
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{Chunk, ChunkType};
    use crate::embeddings::{EmbeddingProvider, HashEmbeddings};
    use crate::keyword::Bm25KeywordIndex;
    use crate::store::{MemoryVectorStore, StoreError, VectorPoint};
    use anyhow::Result;
    use async_trait::async_trait;

    const EMPTY: &[SearchResult] = &[];

    fn result(id: &str) -> SearchResult {
        SearchResult {
            id: id.to_string(),
            file_path: format!("{}.go", id),
            code: String::new(),
            language: "go".to_string(),
            score: 0.0,
            line_start: 1,
            line_end: 2,
            repository: String::new(),
            chunk_type: "function".to_string(),
            name: String::new(),
        }
    }

    fn ranked(ids: &[&str]) -> Vec<SearchResult> {
        ids.iter().map(|id| result(id)).collect()
    }

    fn ids(results: &[SearchResult]) -> Vec<&str> {
        results.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn test_search_config_default() {
        let config = SearchConfig::default();
        assert!((config.rrf_k - 60.0).abs() < f32::EPSILON);
        assert!((config.semantic_weight - 1.0).abs() < f32::EPSILON);
        assert_eq!(config.candidate_multiplier, 2);
        assert_eq!(config.rerank_top_n, 20);
    }

    #[test]
    fn test_rrf_fusion() {
        let semantic = ranked(&["doc1", "doc2", "doc3"]);
        let keyword = ranked(&["doc2", "doc1", "doc4"]);

        let fused = reciprocal_rank_fusion(&[(semantic.as_slice(), 1.0), (keyword.as_slice(), 1.0)], 60.0);

        assert_eq!(fused.len(), 4);
        let top_two = ids(&fused[..2]);
        assert!(top_two.contains(&"doc1") && top_two.contains(&"doc2"));
    }

    #[test]
    fn test_rrf_first_in_both_beats_first_in_one() {
        let semantic = ranked(&["both", "a", "b"]);
        let keyword = ranked(&["both", "c", "d"]);
        let fused = reciprocal_rank_fusion(&[(semantic.as_slice(), 1.0), (keyword.as_slice(), 1.0)], 60.0);
        assert_eq!(fused[0].id, "both");
        assert!((fused[0].score - 2.0 / 61.0).abs() < 1e-6);
        assert!(fused[1].score < fused[0].score);
    }

    #[test]
    fn test_rrf_single_source() {
        let semantic = ranked(&["doc1", "doc2"]);
        let fused = reciprocal_rank_fusion(&[(semantic.as_slice(), 1.0), (EMPTY, 1.0)], 60.0);

        assert_eq!(ids(&fused), vec!["doc1", "doc2"]);
    }

    #[test]
    fn test_rrf_empty_inputs() {
        assert!(reciprocal_rank_fusion(&[(EMPTY, 1.0), (EMPTY, 1.0)], 60.0).is_empty());
    }

    #[test]
    fn test_rrf_ties_keep_first_appearance() {
        let semantic = ranked(&["doc1"]);
        let keyword = ranked(&["doc2"]);
        let fused = reciprocal_rank_fusion(&[(semantic.as_slice(), 1.0), (keyword.as_slice(), 1.0)], 60.0);

        assert_eq!(ids(&fused), vec!["doc1", "doc2"]);
        assert!((fused[0].score - fused[1].score).abs() < f32::EPSILON);
    }

    #[test]
    fn test_rrf_k_parameter_effect() {
        let semantic = ranked(&["doc1", "doc2"]);

        let low = reciprocal_rank_fusion(&[(semantic.as_slice(), 1.0)], 10.0);
        let high = reciprocal_rank_fusion(&[(semantic.as_slice(), 1.0)], 100.0);

        assert!(low[0].score - low[1].score > high[0].score - high[1].score);
    }

    #[test]
    fn test_dedup_by_location() {
        let mut a = result("a");
        let mut b = result("b");
        b.file_path = a.file_path.clone();
        a.score = 2.0;
        let c = result("c");
        let deduped = dedup_by_location(vec![a, b, c]);
        assert_eq!(ids(&deduped), vec!["a", "c"]);
    }

    fn chunk(path: &str, name: &str, code: &str) -> Chunk {
        Chunk {
            code: code.to_string(),
            language: "go".to_string(),
            file_path: path.to_string(),
            line_start: 1,
            line_end: 3,
            chunk_type: ChunkType::Function,
            name: name.to_string(),
            repository: String::new(),
            symbols: Vec::new(),
            signature: None,
            file_context: String::new(),
            parent_context: None,
        }
    }

    struct DownStore;

    #[async_trait]
    impl VectorStore for DownStore {
        async fn create_collection(&self, _: &str, _: usize) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn upsert(&self, _: &str, _: Vec<VectorPoint>) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn search(
            &self,
            _: &str,
            _: &[f32],
            _: usize,
            _: Option<&SearchFilter>,
        ) -> Result<Vec<VectorHit>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn delete(&self, _: &str, _: &[String]) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn delete_file(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn delete_collection(&self, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn swap_collection(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn count(&self, _: &str) -> Result<usize, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    struct FailingReranker;

    #[async_trait]
    impl Reranker for FailingReranker {
        async fn rerank(&self, _: &str, _: &[SearchResult], _: usize) -> Result<Vec<SearchResult>> {
            anyhow::bail!("connection refused")
        }
    }

    struct ReversingReranker;

    #[async_trait]
    impl Reranker for ReversingReranker {
        async fn rerank(
            &self,
            _: &str,
            candidates: &[SearchResult],
            _: usize,
        ) -> Result<Vec<SearchResult>> {
            Ok(candidates.iter().rev().cloned().collect())
        }
    }

    fn embedder() -> Arc<Embedder> {
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbeddings::new(64));
        Arc::new(Embedder::new(provider, 100, 16))
    }

    fn keyword_with(chunks: &[Chunk]) -> Arc<dyn KeywordIndex> {
        let index = Bm25KeywordIndex::new();
        index.index_chunks("code", chunks).unwrap();
        Arc::new(index)
    }

    async fn memory_with(chunks: &[Chunk], embedder: &Embedder) -> Arc<dyn VectorStore> {
        let store = MemoryVectorStore::new();
        let mut points = Vec::new();
        for c in chunks {
            points.push(VectorPoint {
                id: c.id(),
                vector: embedder.embed_code(&c.embedding_text(), &c.language).await.unwrap(),
                payload: PointPayload::from_chunk(c),
            });
        }
        store.upsert("code", points).await.unwrap();
        Arc::new(store)
    }

    fn sample_chunks() -> Vec<Chunk> {
        vec![
            chunk(
                "auth/login.go",
                "Login",
                "func Login(user string, password string) error {\n\treturn checkPassword(user, password)\n}",
            ),
            chunk(
                "render/page.go",
                "RenderPage",
                "func RenderPage(w io.Writer, title string) error {\n\treturn tmpl.Execute(w, title)\n}",
            ),
        ]
    }

    #[tokio::test]
    async fn test_hybrid_search_finds_both_paths() {
        let chunks = sample_chunks();
        let embedder = embedder();
        let store = memory_with(&chunks, &embedder).await;
        let searcher = HybridSearcher::new(
            SearchConfig::default(),
            embedder,
            store,
            Some(keyword_with(&chunks)),
        );

        let results = searcher.search("login password", "code", 5, None).await.unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].file_path, "auth/login.go");
        // Same chunk from both paths appears once.
        let unique: HashSet<_> = results.iter().map(|r| r.location_key()).collect();
        assert_eq!(unique.len(), results.len());
    }

    #[tokio::test]
    async fn test_semantic_failure_serves_keyword_results() {
        let chunks = sample_chunks();
        let searcher = HybridSearcher::new(
            SearchConfig::default(),
            embedder(),
            Arc::new(DownStore),
            Some(keyword_with(&chunks)),
        );

        let results = searcher.search("RenderPage", "code", 5, None).await.unwrap();
        assert_eq!(results[0].name, "RenderPage");
    }

    #[tokio::test]
    async fn test_semantic_failure_without_keyword_errors() {
        let searcher =
            HybridSearcher::new(SearchConfig::default(), embedder(), Arc::new(DownStore), None);
        let err = searcher.search("anything", "code", 5, None).await.unwrap_err();
        assert!(matches!(err, SearchError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_semantic_failure_with_no_keyword_hits_is_empty() {
        let searcher = HybridSearcher::new(
            SearchConfig::default(),
            embedder(),
            Arc::new(DownStore),
            Some(keyword_with(&[])),
        );
        let results = searcher.search("anything", "code", 5, None).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_filter_applies_to_keyword_results() {
        let chunks = sample_chunks();
        let searcher = HybridSearcher::new(
            SearchConfig::default(),
            embedder(),
            Arc::new(DownStore),
            Some(keyword_with(&chunks)),
        );
        let filter = SearchFilter::new().with_file_path("render/page.go");
        let results = searcher
            .search("error string", "code", 5, Some(&filter))
            .await
            .unwrap();
        assert!(results.iter().all(|r| r.file_path == "render/page.go"));
    }

    #[tokio::test]
    async fn test_cross_encoder_failure_keeps_order() {
        let chunks = sample_chunks();
        let embedder = embedder();
        let store = memory_with(&chunks, &embedder).await;
        let plain = HybridSearcher::new(
            SearchConfig::default(),
            embedder.clone(),
            store.clone(),
            Some(keyword_with(&chunks)),
        );
        let failing = HybridSearcher::new(
            SearchConfig::default(),
            embedder,
            store,
            Some(keyword_with(&chunks)),
        )
        .with_reranker(Arc::new(FailingReranker));

        let expected = plain.search("login", "code", 5, None).await.unwrap();
        let got = failing.search("login", "code", 5, None).await.unwrap();
        assert_eq!(ids(&expected), ids(&got));
    }

    #[tokio::test]
    async fn test_cross_encoder_reorders_head() {
        let chunks = sample_chunks();
        let embedder = embedder();
        let store = memory_with(&chunks, &embedder).await;
        let plain = HybridSearcher::new(SearchConfig::default(), embedder.clone(), store.clone(), None);
        let reranked = HybridSearcher::new(SearchConfig::default(), embedder, store, None)
            .with_reranker(Arc::new(ReversingReranker));

        let mut expected = plain.search("login", "code", 5, None).await.unwrap();
        expected.reverse();
        let got = reranked.search("login", "code", 5, None).await.unwrap();
        assert_eq!(ids(&expected), ids(&got));
    }

    #[tokio::test]
    async fn test_zero_limit_and_blank_query() {
        let searcher =
            HybridSearcher::new(SearchConfig::default(), embedder(), Arc::new(DownStore), None);
        assert!(searcher.search("x", "code", 0, None).await.unwrap().is_empty());
        assert!(searcher.search("   ", "code", 5, None).await.unwrap().is_empty());
    }
}
