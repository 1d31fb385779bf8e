//! Bounded LRU cache of computed embeddings.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;
use sha2::{Digest, Sha256};

/// Texts up to this many characters are used as their own cache key.
const KEY_PREFIX_CHARS: usize = 100;

/// Hit/miss counters and current occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct EmbeddingCacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Thread-safe cache from text to embedding vector.
pub struct EmbeddingCache {
    inner: Mutex<LruCache<String, Arc<Vec<f32>>>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            capacity: cap.get(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cache key for `text`: the text itself when short, otherwise its
    /// first 100 characters followed by a hex digest prefix of the whole.
    pub fn key(text: &str) -> String {
        match text.char_indices().nth(KEY_PREFIX_CHARS) {
            None => text.to_string(),
            Some((cut, _)) => {
                let digest = Sha256::digest(text.as_bytes());
                format!("{}{}", &text[..cut], hex::encode(&digest[..8]))
            }
        }
    }

    pub fn get(&self, text: &str) -> Option<Arc<Vec<f32>>> {
        let key = Self::key(text);
        let found = self.lock().get(&key).cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    pub fn insert(&self, text: &str, embedding: Vec<f32>) {
        self.lock().put(Self::key(text), Arc::new(embedding));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn stats(&self) -> EmbeddingCacheStats {
        EmbeddingCacheStats {
            entries: self.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    // A panic while holding the lock leaves the LRU structurally valid.
    fn lock(&self) -> MutexGuard<'_, LruCache<String, Arc<Vec<f32>>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
