//! Engine-owned caches for search results and per-file chunks.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use lru::LruCache;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::chunker::Chunk;
use crate::search::SearchResult;

fn capacity(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SearchKey {
    query: String,
    collection: String,
    limit: usize,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    results: Vec<SearchResult>,
    inserted: Instant,
    hit_count: u64,
}

/// Hit/miss figures of the search cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SearchCacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

struct SearchCacheInner {
    entries: LruCache<SearchKey, CacheEntry>,
    hits: u64,
    misses: u64,
    /// Bumped by `clear`
    epoch: u64,
    /// Bumped by `invalidate_collection`
    generations: HashMap<String, u64>,
}

impl SearchCacheInner {
    fn generation(&self, collection: &str) -> u64 {
        self.epoch + self.generations.get(collection).copied().unwrap_or(0)
    }
}

/// LRU cache of search results with a time-to-live.
pub struct SearchCache {
    inner: Mutex<SearchCacheInner>,
    ttl: Duration,
    capacity: usize,
}

impl SearchCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let cap = capacity(max_entries);
        Self {
            inner: Mutex::new(SearchCacheInner {
                entries: LruCache::new(cap),
                hits: 0,
                misses: 0,
                epoch: 0,
                generations: HashMap::new(),
            }),
            ttl,
            capacity: cap.get(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SearchCacheInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn key(query: &str, collection: &str, limit: usize) -> SearchKey {
        SearchKey {
            query: query.to_string(),
            collection: collection.to_string(),
            limit,
        }
    }

    /// Cached results, if present and younger than the TTL. Expired
    /// entries are dropped on access.
    pub fn get(&self, query: &str, collection: &str, limit: usize) -> Option<Vec<SearchResult>> {
        let key = Self::key(query, collection, limit);
        let mut inner = self.lock();

        let expired = match inner.entries.get_mut(&key) {
            Some(entry) if entry.inserted.elapsed() < self.ttl => {
                entry.hit_count += 1;
                let results = entry.results.clone();
                inner.hits += 1;
                return Some(results);
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            inner.entries.pop(&key);
        }
        inner.misses += 1;
        None
    }

    /// Invalidation counter of `collection`. Capture it before running a
    /// search and hand it to [`SearchCache::insert`].
    pub fn generation(&self, collection: &str) -> u64 {
        self.lock().generation(collection)
    }

    /// Cache `results` unless `collection` was invalidated after
    /// `generation` was taken. Returns whether the entry was stored.
    pub fn insert(
        &self,
        query: &str,
        collection: &str,
        limit: usize,
        generation: u64,
        results: Vec<SearchResult>,
    ) -> bool {
        let mut inner = self.lock();
        if inner.generation(collection) != generation {
            debug!(query, collection, "Collection changed during search, not caching");
            return false;
        }
        let entry = CacheEntry {
            results,
            inserted: Instant::now(),
            hit_count: 0,
        };
        inner.entries.put(Self::key(query, collection, limit), entry);
        true
    }

    /// Number of times a cached entry was served, if it is still cached.
    pub fn hit_count(&self, query: &str, collection: &str, limit: usize) -> Option<u64> {
        self.lock()
            .entries
            .peek(&Self::key(query, collection, limit))
            .map(|e| e.hit_count)
    }

    /// Drop every entry for `collection`. Returns how many were removed.
    pub fn invalidate_collection(&self, collection: &str) -> usize {
        let mut inner = self.lock();
        *inner.generations.entry(collection.to_string()).or_insert(0) += 1;
        let stale: Vec<SearchKey> = inner
            .entries
            .iter()
            .filter(|(k, _)| k.collection == collection)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            inner.entries.pop(key);
        }
        if !stale.is_empty() {
            debug!(collection, removed = stale.len(), "Invalidated search cache");
        }
        stale.len()
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.epoch += 1;
        inner.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> SearchCacheStats {
        let inner = self.lock();
        let total = inner.hits + inner.misses;
        SearchCacheStats {
            entries: inner.entries.len(),
            capacity: self.capacity,
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                inner.hits as f64 / total as f64
            },
        }
    }
}

/// Chunks of recently chunked files, valid while the file's modification
/// time and content hash are both unchanged.
pub struct FileChunkCache {
    inner: Mutex<LruCache<PathBuf, FileEntry>>,
}

struct FileEntry {
    mtime: SystemTime,
    content_hash: String,
    chunks: Vec<Chunk>,
}

impl FileChunkCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity(max_entries))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<PathBuf, FileEntry>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cached chunks for `path` when they were produced from a file with
    /// the same `mtime` and `content_hash`. A stale entry is removed.
    pub fn get(&self, path: &Path, mtime: SystemTime, content_hash: &str) -> Option<Vec<Chunk>> {
        let mut cache = self.lock();
        match cache.get(path) {
            Some(entry) if entry.mtime == mtime && entry.content_hash == content_hash => {
                Some(entry.chunks.clone())
            }
            Some(_) => {
                cache.pop(path);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, path: &Path, mtime: SystemTime, content_hash: &str, chunks: Vec<Chunk>) {
        let entry = FileEntry {
            mtime,
            content_hash: content_hash.to_string(),
            chunks,
        };
        self.lock().put(path.to_path_buf(), entry);
    }

    pub fn invalidate<P: AsRef<Path>>(&self, paths: &[P]) {
        let mut cache = self.lock();
        for path in paths {
            cache.pop(path.as_ref());
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkType;

    fn result(id: &str) -> SearchResult {
        SearchResult {
            id: id.to_string(),
            file_path: "a.go".to_string(),
            code: String::new(),
            language: "go".to_string(),
            score: 1.0,
            line_start: 1,
            line_end: 2,
            repository: String::new(),
            chunk_type: "function".to_string(),
            name: String::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_cache_ttl() {
        let cache = SearchCache::new(10, Duration::from_secs(60));
        cache.insert("q", "code", 5, cache.generation("code"), vec![result("1")]);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cache.get("q", "code", 5).map(|r| r.len()), Some(1));
        assert_eq!(cache.hit_count("q", "code", 5), Some(1));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cache.get("q", "code", 5).is_none());
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_search_cache_key_includes_limit_and_collection() {
        let cache = SearchCache::new(10, Duration::from_secs(60));
        cache.insert("q", "code", 5, cache.generation("code"), vec![result("1")]);
        assert!(cache.get("q", "code", 10).is_none());
        assert!(cache.get("q", "other", 5).is_none());
        assert!(cache.get("q", "code", 5).is_some());
    }

    #[test]
    fn test_search_cache_evicts_least_recently_used() {
        let cache = SearchCache::new(2, Duration::from_secs(60));
        cache.insert("a", "code", 5, cache.generation("code"), vec![]);
        cache.insert("b", "code", 5, cache.generation("code"), vec![]);
        assert!(cache.get("a", "code", 5).is_some());
        cache.insert("c", "code", 5, cache.generation("code"), vec![]);

        assert_eq!(cache.len(), 2);
        assert!(cache.get("b", "code", 5).is_none());
        assert!(cache.get("a", "code", 5).is_some());
        assert!(cache.get("c", "code", 5).is_some());
    }

    #[test]
    fn test_invalidate_collection() {
        let cache = SearchCache::new(10, Duration::from_secs(60));
        cache.insert("a", "one", 5, cache.generation("one"), vec![]);
        cache.insert("b", "one", 5, cache.generation("one"), vec![]);
        cache.insert("a", "two", 5, cache.generation("two"), vec![]);

        assert_eq!(cache.invalidate_collection("one"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("a", "two", 5).is_some());

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_insert_after_invalidation_is_dropped() {
        let cache = SearchCache::new(10, Duration::from_secs(60));
        let before = cache.generation("code");
        let other = cache.generation("other");

        // An index update lands while the search is running.
        cache.invalidate_collection("code");
        assert!(!cache.insert("q", "code", 5, before, vec![result("stale")]));
        assert!(cache.get("q", "code", 5).is_none());

        assert!(cache.insert("q", "other", 5, other, vec![result("1")]));
        cache.clear();
        assert!(!cache.insert("q", "other", 5, other, vec![result("2")]));
        assert!(cache.is_empty());
    }

    fn chunk() -> Chunk {
        Chunk {
            code: "fn a() {}".to_string(),
            language: "rust".to_string(),
            file_path: "a.rs".to_string(),
            line_start: 1,
            line_end: 1,
            chunk_type: ChunkType::Function,
            name: "a".to_string(),
            repository: String::new(),
            symbols: Vec::new(),
            signature: None,
            file_context: String::new(),
            parent_context: None,
        }
    }

    #[test]
    fn test_file_chunk_cache_mtime() {
        let cache = FileChunkCache::new(10);
        let path = Path::new("a.rs");
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let t1 = t0 + Duration::from_secs(1);

        cache.insert(path, t0, "h1", vec![chunk()]);
        assert_eq!(cache.get(path, t0, "h1").map(|c| c.len()), Some(1));
        assert!(cache.get(path, t1, "h1").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_file_chunk_cache_same_mtime_new_content() {
        let cache = FileChunkCache::new(10);
        let path = Path::new("a.rs");
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(100);

        cache.insert(path, t0, "h1", vec![chunk()]);
        assert!(cache.get(path, t0, "h2").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_file_chunk_cache_invalidate() {
        let cache = FileChunkCache::new(1);
        let t0 = SystemTime::UNIX_EPOCH;
        cache.insert(Path::new("a.rs"), t0, "h", vec![chunk()]);
        cache.insert(Path::new("b.rs"), t0, "h", vec![chunk()]);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(Path::new("a.rs"), t0, "h").is_none());

        cache.invalidate(&[PathBuf::from("b.rs")]);
        assert!(cache.is_empty());
    }
}
