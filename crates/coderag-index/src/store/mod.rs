//! Vector store abstraction.
//!
//! Collections hold one point per chunk, keyed by the chunk's
//! deterministic id, so re-upserting the same chunk overwrites it.

pub mod memory;
pub mod qdrant;

pub use memory::MemoryVectorStore;
pub use qdrant::QdrantStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chunker::Chunk;

/// Errors returned by vector store backends.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Vector store unavailable: {0}")]
    Unavailable(String),

    #[error("Vector store timed out during {0}")]
    Timeout(&'static str),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Vector dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Vector store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether the store could not be reached at all. Explicit indexing
    /// calls abort on these instead of counting a per-file failure.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

/// Metadata stored with each vector point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointPayload {
    pub file_path: String,
    pub code: String,
    pub language: String,
    pub chunk_type: String,
    pub name: String,
    pub line_start: usize,
    pub line_end: usize,
    pub repository: String,
    pub signature: Option<String>,
}

impl PointPayload {
    pub fn from_chunk(chunk: &Chunk) -> Self {
        Self {
            file_path: chunk.file_path.clone(),
            code: chunk.code.clone(),
            language: chunk.language.clone(),
            chunk_type: chunk.chunk_type.as_str().to_string(),
            name: chunk.name.clone(),
            line_start: chunk.line_start,
            line_end: chunk.line_end,
            repository: chunk.repository.clone(),
            signature: chunk.signature.clone(),
        }
    }
}

/// A point to upsert.
#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: PointPayload,
}

/// A search hit. Cosine similarity, higher is better.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub score: f32,
    pub payload: PointPayload,
}

/// Conditions ANDed together; `chunk_types` entries are ORed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilter {
    pub language: Option<String>,
    pub chunk_types: Option<Vec<String>>,
    pub file_path: Option<String>,
    pub repository: Option<String>,
}

impl SearchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_chunk_types(mut self, types: Vec<String>) -> Self {
        self.chunk_types = Some(types);
        self
    }

    pub fn with_file_path(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.language.is_none()
            && self.chunk_types.as_ref().map_or(true, |t| t.is_empty())
            && self.file_path.is_none()
            && self.repository.is_none()
    }

    /// Evaluate the filter against a payload.
    pub fn matches(&self, payload: &PointPayload) -> bool {
        if let Some(ref language) = self.language {
            if !payload.language.eq_ignore_ascii_case(language) {
                return false;
            }
        }
        if let Some(ref types) = self.chunk_types {
            if !types.is_empty() && !types.iter().any(|t| t == &payload.chunk_type) {
                return false;
            }
        }
        if let Some(ref path) = self.file_path {
            if &payload.file_path != path {
                return false;
            }
        }
        if let Some(ref repository) = self.repository {
            if &payload.repository != repository {
                return false;
            }
        }
        true
    }
}

/// Backend-neutral vector store operations.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create `name` if it does not already exist.
    async fn create_collection(&self, name: &str, dimensions: usize) -> Result<(), StoreError>;

    /// Insert or overwrite points. Creates the collection on first use.
    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<(), StoreError>;

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<VectorHit>, StoreError>;

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<(), StoreError>;

    /// Delete every point whose `file_path` equals `file_path`.
    async fn delete_file(&self, collection: &str, file_path: &str) -> Result<(), StoreError>;

    async fn delete_collection(&self, name: &str) -> Result<(), StoreError>;

    /// Make the contents of `temp` visible under `live` and drop whatever
    /// `live` held before. `temp` is left untouched when the swap fails.
    async fn swap_collection(&self, live: &str, temp: &str) -> Result<(), StoreError>;

    async fn list_collections(&self) -> Result<Vec<String>, StoreError>;

    /// Number of points in `collection`; zero when it does not exist.
    async fn count(&self, collection: &str) -> Result<usize, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkType;

    fn payload() -> PointPayload {
        PointPayload {
            file_path: "src/user.go".to_string(),
            code: "func LoadUser() {}".to_string(),
            language: "go".to_string(),
            chunk_type: "function".to_string(),
            name: "LoadUser".to_string(),
            line_start: 3,
            line_end: 3,
            repository: "svc".to_string(),
            signature: None,
        }
    }

    #[test]
    fn test_unavailable_classification() {
        assert!(StoreError::Unavailable("down".into()).is_unavailable());
        assert!(StoreError::Timeout("search").is_unavailable());
        assert!(!StoreError::CollectionNotFound("x".into()).is_unavailable());
        assert!(!StoreError::Backend("bad".into()).is_unavailable());
    }

    #[test]
    fn test_filter_matches() {
        let p = payload();
        assert!(SearchFilter::new().matches(&p));
        assert!(SearchFilter::new().with_language("Go").matches(&p));
        assert!(!SearchFilter::new().with_language("rust").matches(&p));
        assert!(SearchFilter::new()
            .with_chunk_types(vec!["method".into(), "function".into()])
            .matches(&p));
        assert!(!SearchFilter::new()
            .with_chunk_types(vec!["type".into()])
            .matches(&p));
        assert!(SearchFilter::new().with_file_path("src/user.go").matches(&p));
        assert!(!SearchFilter::new().with_file_path("src/other.go").matches(&p));
        assert!(!SearchFilter::new().with_repository("web").matches(&p));
    }

    #[test]
    fn test_filter_is_empty() {
        assert!(SearchFilter::new().is_empty());
        assert!(SearchFilter::new().with_chunk_types(vec![]).is_empty());
        assert!(!SearchFilter::new().with_language("go").is_empty());
    }

    #[test]
    fn test_payload_from_chunk() {
        let chunk = Chunk {
            code: "fn a() {}".to_string(),
            language: "rust".to_string(),
            file_path: "src/a.rs".to_string(),
            line_start: 1,
            line_end: 1,
            chunk_type: ChunkType::Function,
            name: "a".to_string(),
            repository: "repo".to_string(),
            symbols: vec!["a".to_string()],
            signature: Some("fn a()".to_string()),
            file_context: String::new(),
            parent_context: None,
        };
        let payload = PointPayload::from_chunk(&chunk);
        assert_eq!(payload.chunk_type, "function");
        assert_eq!(payload.signature.as_deref(), Some("fn a()"));
        assert_eq!(payload.repository, "repo");
    }
}
