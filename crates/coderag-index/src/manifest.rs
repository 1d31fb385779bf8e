//! Index manifest for tracking indexed files and their state.
//!
//! Each collection records, per file, the content hash it was indexed
//! from and the ids of the chunks that were written. The ids let a
//! re-index delete exactly the previous documents, and the hashes let
//! incremental repository indexing skip unchanged files.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// SHA-256 of `content` as lowercase hex.
pub fn content_hash(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// State of an indexed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileState {
    /// SHA256 hash of the file content
    pub content_hash: String,
    pub indexed_at: DateTime<Utc>,
    /// IDs of the chunks written for this file
    pub chunk_ids: Vec<String>,
}

/// Files indexed into one collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionManifest {
    pub files: HashMap<String, FileState>,
    pub total_chunks: usize,
}

/// Manifest tracking the state of indexed files, per collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexManifest {
    /// Version of the manifest format
    pub version: u32,
    pub last_updated: Option<DateTime<Utc>>,
    pub collections: HashMap<String, CollectionManifest>,
}

impl Default for IndexManifest {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexManifest {
    pub fn new() -> Self {
        Self {
            version: 2,
            last_updated: None,
            collections: HashMap::new(),
        }
    }

    /// Load manifest from a file.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path).map_err(ManifestError::Io)?;
        serde_json::from_str(&content).map_err(ManifestError::Parse)
    }

    /// Load a saved manifest, or start empty when none exists.
    pub fn load_or_new(path: &Path) -> Result<Self, ManifestError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::new())
        }
    }

    /// Save manifest to a file.
    pub fn save(&self, path: &Path) -> Result<(), ManifestError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ManifestError::Io)?;
        }
        let content = serde_json::to_string_pretty(self).map_err(ManifestError::Serialize)?;
        std::fs::write(path, content).map_err(ManifestError::Io)
    }

    pub fn file(&self, collection: &str, path: &str) -> Option<&FileState> {
        self.collections.get(collection)?.files.get(path)
    }

    /// Check if a file needs re-indexing.
    pub fn needs_update(&self, collection: &str, path: &str, current_hash: &str) -> bool {
        match self.file(collection, path) {
            Some(state) => state.content_hash != current_hash,
            None => true,
        }
    }

    /// Record that a file was indexed, replacing any earlier state.
    pub fn record_indexed(
        &mut self,
        collection: &str,
        path: &str,
        content_hash: String,
        chunk_ids: Vec<String>,
    ) {
        let entry = self.collections.entry(collection.to_string()).or_default();
        if let Some(old) = entry.files.get(path) {
            entry.total_chunks = entry.total_chunks.saturating_sub(old.chunk_ids.len());
        }
        entry.total_chunks += chunk_ids.len();
        entry.files.insert(
            path.to_string(),
            FileState {
                content_hash,
                indexed_at: Utc::now(),
                chunk_ids,
            },
        );
        self.last_updated = Some(Utc::now());
    }

    /// Remove a file from a collection's manifest.
    pub fn remove_file(&mut self, collection: &str, path: &str) -> Option<FileState> {
        let entry = self.collections.get_mut(collection)?;
        let state = entry.files.remove(path)?;
        entry.total_chunks = entry.total_chunks.saturating_sub(state.chunk_ids.len());
        self.last_updated = Some(Utc::now());
        Some(state)
    }

    /// Indexed paths of a collection, sorted.
    pub fn files(&self, collection: &str) -> Vec<String> {
        let mut files: Vec<String> = self
            .collections
            .get(collection)
            .map(|c| c.files.keys().cloned().collect())
            .unwrap_or_default();
        files.sort();
        files
    }

    /// Files in the manifest but not in `current_files`. Sorted.
    pub fn find_deleted_files(&self, collection: &str, current_files: &[String]) -> Vec<String> {
        let current: HashSet<&str> = current_files.iter().map(String::as_str).collect();
        self.files(collection)
            .into_iter()
            .filter(|p| !current.contains(p.as_str()))
            .collect()
    }

    pub fn total_chunks(&self, collection: &str) -> usize {
        self.collections
            .get(collection)
            .map_or(0, |c| c.total_chunks)
    }

    /// Indexed files across every collection.
    pub fn file_count(&self) -> usize {
        self.collections.values().map(|c| c.files.len()).sum()
    }

    /// Chunks across every collection.
    pub fn chunk_count(&self) -> usize {
        self.collections.values().map(|c| c.total_chunks).sum()
    }

    pub fn clear_collection(&mut self, collection: &str) {
        if self.collections.remove(collection).is_some() {
            self.last_updated = Some(Utc::now());
        }
    }

    /// Replace `live` with the contents recorded under `temp`.
    pub fn swap_collection(&mut self, live: &str, temp: &str) {
        let state = self.collections.remove(temp).unwrap_or_default();
        self.collections.insert(live.to_string(), state);
        self.last_updated = Some(Utc::now());
    }

    /// Clear the entire manifest.
    pub fn clear(&mut self) {
        self.collections.clear();
        self.last_updated = Some(Utc::now());
    }
}

/// Errors that can occur when working with manifests.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("IO error: {0}")]
    Io(#[source] std::io::Error),

    #[error("Failed to parse manifest: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("Failed to serialize manifest: {0}")]
    Serialize(#[source] serde_json::Error),
}
