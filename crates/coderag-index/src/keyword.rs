//! Lexical index over chunks, one namespace per collection.
//!
//! Each chunk is stored as a document with separately scored fields.
//! A query is an OR over weighted clauses: exact phrase in the content,
//! name match, fuzzy content terms, plain content BM25 and symbol BM25.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::chunker::{extract_symbols, Chunk};
use crate::search::bm25::BM25Index;
use crate::search::SearchResult;
use crate::tokens::edit_distance_within;

const PHRASE_BOOST: f64 = 5.0;
const EXACT_NAME_BOOST: f64 = 4.0;
const NAME_BOOST: f64 = 3.0;
const FUZZY_BOOST: f64 = 2.0;
const CONTENT_BOOST: f64 = 1.0;
const SYMBOL_BOOST: f64 = 0.8;

/// Maximum edit distance for fuzzy term matches.
const FUZZINESS: usize = 2;
/// Shorter query terms are too ambiguous to match fuzzily.
const MIN_FUZZY_TERM_CHARS: usize = 4;

#[derive(Error, Debug)]
pub enum KeywordError {
    #[error("Keyword collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Failed to persist keyword index: {0}")]
    Persist(String),
}

/// Operations the hybrid searcher and the indexers need from a lexical
/// engine.
pub trait KeywordIndex: Send + Sync {
    fn index_chunk(&self, collection: &str, chunk: &Chunk) -> Result<(), KeywordError>;

    fn index_chunks(&self, collection: &str, chunks: &[Chunk]) -> Result<(), KeywordError> {
        for chunk in chunks {
            self.index_chunk(collection, chunk)?;
        }
        Ok(())
    }

    fn search(
        &self,
        query: &str,
        collection: &str,
        limit: usize,
    ) -> Result<Vec<SearchResult>, KeywordError>;

    /// Remove documents by chunk id. Returns how many were present.
    fn delete_chunks(&self, collection: &str, ids: &[String]) -> Result<usize, KeywordError>;

    /// Remove every document of `file_path`. Returns how many were present.
    fn delete_file(&self, collection: &str, file_path: &str) -> Result<usize, KeywordError>;

    fn delete_collection(&self, collection: &str) -> Result<(), KeywordError>;

    /// Replace `live` with the contents of `temp`.
    fn swap_collection(&self, live: &str, temp: &str) -> Result<(), KeywordError>;

    fn clear(&self) -> Result<(), KeywordError>;

    fn count(&self, collection: &str) -> usize;
}

/// Stored fields of one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordDocument {
    pub id: String,
    pub content: String,
    pub filepath: String,
    pub language: String,
    #[serde(rename = "type")]
    pub chunk_type: String,
    pub name: String,
    pub name_text: String,
    pub symbols: Vec<String>,
    pub signatures: String,
    pub line_start: usize,
    pub line_end: usize,
    pub repository: String,
}

impl KeywordDocument {
    pub fn from_chunk(chunk: &Chunk) -> Self {
        let symbols = if chunk.symbols.is_empty() {
            extract_symbols(&chunk.code, &chunk.language)
        } else {
            chunk.symbols.clone()
        };
        Self {
            id: chunk.id(),
            content: chunk.code.clone(),
            filepath: chunk.file_path.clone(),
            language: chunk.language.clone(),
            chunk_type: chunk.chunk_type.as_str().to_string(),
            name: chunk.name.clone(),
            name_text: chunk.name.clone(),
            symbols,
            signatures: chunk.signature.clone().unwrap_or_default(),
            line_start: chunk.line_start,
            line_end: chunk.line_end,
            repository: chunk.repository.clone(),
        }
    }

    fn to_result(&self, score: f64) -> SearchResult {
        SearchResult {
            id: self.id.clone(),
            file_path: self.filepath.clone(),
            code: self.content.clone(),
            language: self.language.clone(),
            score: score as f32,
            line_start: self.line_start,
            line_end: self.line_end,
            repository: self.repository.clone(),
            chunk_type: self.chunk_type.clone(),
            name: self.name.clone(),
        }
    }
}

/// Documents and per-field indexes of one collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CollectionIndex {
    documents: HashMap<String, KeywordDocument>,
    content: BM25Index,
    names: BM25Index,
    symbols: BM25Index,
}

impl CollectionIndex {
    fn insert(&mut self, doc: KeywordDocument) {
        self.content.add_document(&doc.id, &doc.content);
        self.names.add_document(&doc.id, &doc.name_text);
        let symbol_text = format!("{} {}", doc.symbols.join(" "), doc.signatures);
        self.symbols.add_document(&doc.id, &symbol_text);
        self.documents.insert(doc.id.clone(), doc);
    }

    fn remove(&mut self, id: &str) -> bool {
        self.content.remove_document(id);
        self.names.remove_document(id);
        self.symbols.remove_document(id);
        self.documents.remove(id).is_some()
    }

    /// Indexed content terms within the fuzzy distance of `term`.
    fn fuzzy_terms(&self, term: &str) -> Vec<String> {
        if term.chars().count() < MIN_FUZZY_TERM_CHARS {
            return if self.content.contains_term(term) {
                vec![term.to_string()]
            } else {
                Vec::new()
            };
        }
        self.content
            .vocabulary()
            .filter(|candidate| edit_distance_within(term, candidate, FUZZINESS).is_some())
            .map(str::to_string)
            .collect()
    }

    fn search(&self, query: &str, limit: usize) -> Vec<SearchResult> {
        let terms = BM25Index::tokenize(query);
        let trimmed = query.trim();
        if terms.is_empty() || trimmed.is_empty() {
            return Vec::new();
        }

        let phrase = trimmed.to_lowercase();
        let lowered_terms: HashSet<&str> = terms.iter().map(String::as_str).collect();

        let mut fuzzy: Vec<String> = terms.iter().flat_map(|t| self.fuzzy_terms(t)).collect();
        fuzzy.sort();
        fuzzy.dedup();

        let mut scored: Vec<(f64, &KeywordDocument)> = self
            .documents
            .values()
            .filter_map(|doc| {
                let mut score = 0.0;

                if doc.content.to_lowercase().contains(&phrase) {
                    score += PHRASE_BOOST;
                }

                let name = doc.name.to_lowercase();
                if !name.is_empty() && (name == phrase || lowered_terms.contains(name.as_str())) {
                    score += EXACT_NAME_BOOST;
                }
                score += NAME_BOOST * self.names.score(&doc.id, &terms);
                score += FUZZY_BOOST * self.content.score(&doc.id, &fuzzy);
                score += CONTENT_BOOST * self.content.score(&doc.id, &terms);
                score += SYMBOL_BOOST * self.symbols.score(&doc.id, &terms);

                (score > 0.0).then_some((score, doc))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.filepath.cmp(&b.1.filepath))
                .then_with(|| a.1.line_start.cmp(&b.1.line_start))
        });

        scored
            .into_iter()
            .take(limit)
            .map(|(score, doc)| doc.to_result(score))
            .collect()
    }
}

/// In-process BM25 keyword index.
#[derive(Debug, Default)]
pub struct Bm25KeywordIndex {
    collections: RwLock<HashMap<String, CollectionIndex>>,
}

impl Bm25KeywordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save(&self, path: &Path) -> Result<(), KeywordError> {
        let json = serde_json::to_string(&*self.read())
            .map_err(|e| KeywordError::Persist(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| KeywordError::Persist(e.to_string()))?;
        }
        fs::write(path, json).map_err(|e| KeywordError::Persist(e.to_string()))?;
        debug!(path = %path.display(), "Saved keyword index");
        Ok(())
    }

    /// Load a saved index; a missing file gives an empty index.
    pub fn load(path: &Path) -> Result<Self, KeywordError> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let json = fs::read_to_string(path).map_err(|e| KeywordError::Persist(e.to_string()))?;
        let collections: HashMap<String, CollectionIndex> =
            serde_json::from_str(&json).map_err(|e| KeywordError::Persist(e.to_string()))?;
        Ok(Self {
            collections: RwLock::new(collections),
        })
    }

    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, CollectionIndex>> {
        self.collections.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, CollectionIndex>> {
        self.collections.write().unwrap_or_else(|p| p.into_inner())
    }
}

impl KeywordIndex for Bm25KeywordIndex {
    fn index_chunk(&self, collection: &str, chunk: &Chunk) -> Result<(), KeywordError> {
        self.write()
            .entry(collection.to_string())
            .or_default()
            .insert(KeywordDocument::from_chunk(chunk));
        Ok(())
    }

    fn index_chunks(&self, collection: &str, chunks: &[Chunk]) -> Result<(), KeywordError> {
        let mut collections = self.write();
        let target = collections.entry(collection.to_string()).or_default();
        for chunk in chunks {
            target.insert(KeywordDocument::from_chunk(chunk));
        }
        Ok(())
    }

    fn search(
        &self,
        query: &str,
        collection: &str,
        limit: usize,
    ) -> Result<Vec<SearchResult>, KeywordError> {
        Ok(self
            .read()
            .get(collection)
            .map(|c| c.search(query, limit))
            .unwrap_or_default())
    }

    fn delete_chunks(&self, collection: &str, ids: &[String]) -> Result<usize, KeywordError> {
        let mut collections = self.write();
        let Some(target) = collections.get_mut(collection) else {
            return Ok(0);
        };
        Ok(ids.iter().filter(|id| target.remove(id)).count())
    }

    fn delete_file(&self, collection: &str, file_path: &str) -> Result<usize, KeywordError> {
        let mut collections = self.write();
        let Some(target) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let ids: Vec<String> = target
            .documents
            .values()
            .filter(|d| d.filepath == file_path)
            .map(|d| d.id.clone())
            .collect();
        for id in &ids {
            target.remove(id);
        }
        Ok(ids.len())
    }

    fn delete_collection(&self, collection: &str) -> Result<(), KeywordError> {
        self.write().remove(collection);
        Ok(())
    }

    fn swap_collection(&self, live: &str, temp: &str) -> Result<(), KeywordError> {
        let mut collections = self.write();
        let staged = collections
            .remove(temp)
            .ok_or_else(|| KeywordError::CollectionNotFound(temp.to_string()))?;
        collections.insert(live.to_string(), staged);
        Ok(())
    }

    fn clear(&self) -> Result<(), KeywordError> {
        self.write().clear();
        Ok(())
    }

    fn count(&self, collection: &str) -> usize {
        self.read().get(collection).map_or(0, |c| c.documents.len())
    }
}
