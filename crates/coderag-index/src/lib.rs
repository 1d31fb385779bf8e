//! Hybrid code search with incremental indexing.
//!
//! This crate provides:
//! - AST-based code chunking using tree-sitter
//! - Embedding generation through a local service or OpenAI, with a
//!   hash fallback and an LRU cache
//! - Vector storage in Qdrant, or in memory
//! - Hybrid search (vector + BM25) fused with reciprocal rank fusion
//! - Incremental re-indexing driven by file and git changes
//! - Import/export dependency tracking for dependent invalidation
//! - Adaptive processing of large refactors with rollback

pub mod cache;
pub mod chunker;
pub mod deps;
pub mod embeddings;
pub mod engine;
pub mod incremental;
pub mod keyword;
pub mod manifest;
pub mod refactor;
pub mod reranker;
pub mod search;
pub mod store;
mod tokens;

// Re-exports
pub use cache::{FileChunkCache, SearchCache, SearchCacheStats};
pub use chunker::{Chunk, ChunkType, CodeChunker};
pub use deps::DependencyGraph;
pub use embeddings::{Embedder, EmbeddingProvider, FallbackEmbeddings, HashEmbeddings};
pub use engine::{CodeSearchEngine, DependencyInfo, EngineStatistics};
pub use incremental::{IncrementalIndexer, IndexError, IndexReport};
pub use keyword::{Bm25KeywordIndex, KeywordIndex};
pub use manifest::IndexManifest;
pub use refactor::{
    ChangeType, FileChange, GitChange, GitStatus, ProcessReport, ProcessingMode, RefactorError,
    RefactorHandler, RollbackPoint,
};
pub use reranker::{CrossEncoderReranker, Reranker};
pub use search::{reciprocal_rank_fusion, HybridSearcher, SearchConfig, SearchError, SearchResult};
pub use store::{MemoryVectorStore, QdrantStore, SearchFilter, StoreError, VectorStore};

pub use coderag_config::{Config, DEFAULT_COLLECTION};
