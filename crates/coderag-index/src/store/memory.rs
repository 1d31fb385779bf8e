//! In-memory vector store.
//!
//! Brute-force cosine search over per-collection maps. Used for tests and
//! for running without a Qdrant server.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{SearchFilter, StoreError, VectorHit, VectorPoint, VectorStore};

struct MemoryCollection {
    dimensions: usize,
    points: HashMap<String, VectorPoint>,
}

impl MemoryCollection {
    fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            points: HashMap::new(),
        }
    }
}

/// Vector store that keeps every collection in process memory.
#[derive(Default)]
pub struct MemoryVectorStore {
    collections: RwLock<HashMap<String, MemoryCollection>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return 0.0;
        }

        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }

        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn create_collection(&self, name: &str, dimensions: usize) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        collections
            .entry(name.to_string())
            .or_insert_with(|| MemoryCollection::new(dimensions));
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<(), StoreError> {
        let Some(first) = points.first() else {
            return Ok(());
        };
        let dimensions = first.vector.len();

        let mut collections = self.collections.write().await;
        let target = collections
            .entry(collection.to_string())
            .or_insert_with(|| MemoryCollection::new(dimensions));

        if let Some(bad) = points.iter().find(|p| p.vector.len() != target.dimensions) {
            return Err(StoreError::DimensionMismatch {
                expected: target.dimensions,
                got: bad.vector.len(),
            });
        }

        let count = points.len();
        for point in points {
            target.points.insert(point.id.clone(), point);
        }
        debug!(collection, count, "Upserted points");
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<VectorHit>, StoreError> {
        let collections = self.collections.read().await;
        let target = collections
            .get(collection)
            .ok_or_else(|| StoreError::CollectionNotFound(collection.to_string()))?;

        if vector.len() != target.dimensions {
            return Err(StoreError::DimensionMismatch {
                expected: target.dimensions,
                got: vector.len(),
            });
        }

        let mut scored: Vec<(f32, &VectorPoint)> = target
            .points
            .values()
            .filter(|p| filter.map_or(true, |f| f.matches(&p.payload)))
            .map(|p| (Self::cosine_similarity(vector, &p.vector), p))
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(score, p)| VectorHit {
                id: p.id.clone(),
                score,
                payload: p.payload.clone(),
            })
            .collect())
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        if let Some(target) = collections.get_mut(collection) {
            for id in ids {
                target.points.remove(id);
            }
        }
        Ok(())
    }

    async fn delete_file(&self, collection: &str, file_path: &str) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        if let Some(target) = collections.get_mut(collection) {
            target.points.retain(|_, p| p.payload.file_path != file_path);
        }
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<(), StoreError> {
        self.collections.write().await.remove(name);
        Ok(())
    }

    async fn swap_collection(&self, live: &str, temp: &str) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let staged = collections
            .remove(temp)
            .ok_or_else(|| StoreError::CollectionNotFound(temp.to_string()))?;
        collections.insert(live.to_string(), staged);
        debug!(live, temp, "Swapped collection");
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self.collections.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn count(&self, collection: &str) -> Result<usize, StoreError> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .map_or(0, |c| c.points.len()))
    }
}
