//! Qdrant vector database backend.
//!
//! Every request is bounded by the configured timeout. Offline reindexing
//! publishes a staged collection by pointing an alias with the live name
//! at it.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use coderag_config::VectorStoreConfig;
use qdrant_client::qdrant::{
    condition::ConditionOneOf, point_id::PointIdOptions, value::Kind, Condition,
    CreateAliasBuilder, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter, PointId,
    PointStruct, PointsIdsList, SearchPointsBuilder, UpsertPointsBuilder, Value,
    VectorParamsBuilder,
};
use qdrant_client::{Qdrant, QdrantError};
use tracing::{debug, info, warn};

use super::{PointPayload, SearchFilter, StoreError, VectorHit, VectorPoint, VectorStore};

/// Vector store backed by a Qdrant server.
pub struct QdrantStore {
    client: Qdrant,
    timeout: Duration,
}

impl QdrantStore {
    pub fn connect(config: &VectorStoreConfig) -> Result<Self, StoreError> {
        info!(url = %config.url, "Connecting to Qdrant");

        let mut builder = Qdrant::from_url(&config.url).skip_compatibility_check();
        if let Some(ref api_key) = config.api_key {
            builder = builder.api_key(api_key.clone());
        }
        let client = builder
            .build()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        })
    }

    async fn call<T, F>(&self, op: &'static str, collection: &str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, QdrantError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify(collection, e)),
            Err(_) => {
                warn!(op, collection, "Qdrant request timed out");
                Err(StoreError::Timeout(op))
            }
        }
    }

    async fn collection_exists(&self, name: &str) -> Result<bool, StoreError> {
        self.call("collection_exists", name, self.client.collection_exists(name))
            .await
    }

    /// Alias name to target collection.
    async fn aliases(&self) -> Result<HashMap<String, String>, StoreError> {
        let response = self.call("list_aliases", "", self.client.list_aliases()).await?;
        Ok(response
            .aliases
            .into_iter()
            .map(|a| (a.alias_name, a.collection_name))
            .collect())
    }

    fn build_filter(filter: &SearchFilter) -> Option<Filter> {
        let mut conditions: Vec<Condition> = Vec::new();

        if let Some(ref language) = filter.language {
            conditions.push(Condition::matches("language", language.to_lowercase()));
        }
        if let Some(ref path) = filter.file_path {
            conditions.push(Condition::matches("file_path", path.clone()));
        }
        if let Some(ref repository) = filter.repository {
            conditions.push(Condition::matches("repository", repository.clone()));
        }
        if let Some(ref types) = filter.chunk_types {
            if !types.is_empty() {
                let any_type: Vec<Condition> = types
                    .iter()
                    .map(|t| Condition::matches("chunk_type", t.clone()))
                    .collect();
                conditions.push(Condition {
                    condition_one_of: Some(ConditionOneOf::Filter(Filter::should(any_type))),
                });
            }
        }

        if conditions.is_empty() {
            None
        } else {
            Some(Filter::must(conditions))
        }
    }
}

/// Map a client error onto the store taxonomy.
fn classify(collection: &str, error: QdrantError) -> StoreError {
    let message = error.to_string();
    let lower = message.to_lowercase();
    if lower.contains("not found") || lower.contains("doesn't exist") {
        StoreError::CollectionNotFound(collection.to_string())
    } else if lower.contains("unavailable")
        || lower.contains("transport")
        || lower.contains("connect")
        || lower.contains("refused")
    {
        StoreError::Unavailable(message)
    } else {
        StoreError::Backend(message)
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn create_collection(&self, name: &str, dimensions: usize) -> Result<(), StoreError> {
        if self.collection_exists(name).await? || self.aliases().await?.contains_key(name) {
            debug!(collection = name, "Collection already exists");
            return Ok(());
        }

        info!(collection = name, dimensions, "Creating collection");
        self.call(
            "create_collection",
            name,
            self.client.create_collection(
                CreateCollectionBuilder::new(name)
                    .vectors_config(VectorParamsBuilder::new(dimensions as u64, Distance::Cosine)),
            ),
        )
        .await?;
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<(), StoreError> {
        let Some(first) = points.first() else {
            return Ok(());
        };
        self.create_collection(collection, first.vector.len()).await?;

        debug!(collection, count = points.len(), "Upserting points");
        let qdrant_points: Vec<PointStruct> = points
            .into_iter()
            .map(|p| PointStruct::new(p.id, p.vector, payload_to_qdrant_map(&p.payload)))
            .collect();

        self.call(
            "upsert",
            collection,
            self.client
                .upsert_points(UpsertPointsBuilder::new(collection, qdrant_points).wait(true)),
        )
        .await?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<VectorHit>, StoreError> {
        let mut builder =
            SearchPointsBuilder::new(collection, vector.to_vec(), limit as u64).with_payload(true);
        if let Some(f) = filter.and_then(Self::build_filter) {
            builder = builder.filter(f);
        }

        let response = self
            .call("search", collection, self.client.search_points(builder))
            .await?;

        let hits: Vec<VectorHit> = response
            .result
            .into_iter()
            .map(|p| {
                let id = p
                    .id
                    .and_then(|id| id.point_id_options)
                    .map(|opts| match opts {
                        PointIdOptions::Uuid(u) => u,
                        PointIdOptions::Num(n) => n.to_string(),
                    })
                    .unwrap_or_default();
                VectorHit {
                    id,
                    score: p.score,
                    payload: qdrant_map_to_payload(&p.payload),
                }
            })
            .collect();

        debug!(collection, hits = hits.len(), "Qdrant search complete");
        Ok(hits)
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let point_ids: Vec<PointId> = ids.iter().cloned().map(PointId::from).collect();
        self.call(
            "delete",
            collection,
            self.client.delete_points(
                DeletePointsBuilder::new(collection)
                    .points(PointsIdsList { ids: point_ids })
                    .wait(true),
            ),
        )
        .await?;
        Ok(())
    }

    async fn delete_file(&self, collection: &str, file_path: &str) -> Result<(), StoreError> {
        let filter = Filter::must([Condition::matches("file_path", file_path.to_string())]);
        match self
            .call(
                "delete_file",
                collection,
                self.client
                    .delete_points(DeletePointsBuilder::new(collection).points(filter).wait(true)),
            )
            .await
        {
            Ok(_) | Err(StoreError::CollectionNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete_collection(&self, name: &str) -> Result<(), StoreError> {
        let aliases = self.aliases().await?;
        if let Some(target) = aliases.get(name) {
            self.call("delete_alias", name, self.client.delete_alias(name))
                .await?;
            self.call("delete_collection", target, self.client.delete_collection(target.as_str()))
                .await?;
        } else if self.collection_exists(name).await? {
            self.call("delete_collection", name, self.client.delete_collection(name))
                .await?;
        }
        info!(collection = name, "Deleted collection");
        Ok(())
    }

    async fn swap_collection(&self, live: &str, temp: &str) -> Result<(), StoreError> {
        if !self.collection_exists(temp).await? {
            return Err(StoreError::CollectionNotFound(temp.to_string()));
        }

        let previous = self.aliases().await?.remove(live);
        if previous.is_some() {
            self.call("delete_alias", live, self.client.delete_alias(live))
                .await?;
        } else if self.collection_exists(live).await? {
            // A plain collection cannot share its name with an alias
            self.call("delete_collection", live, self.client.delete_collection(live))
                .await?;
        }

        if let Err(e) = self
            .call(
                "create_alias",
                live,
                self.client.create_alias(CreateAliasBuilder::new(temp, live)),
            )
            .await
        {
            if let Some(old) = previous.as_deref() {
                warn!(live, target = old, error = %e, "Alias switch failed, restoring previous alias");
                if let Err(restore) = self
                    .call(
                        "create_alias",
                        live,
                        self.client.create_alias(CreateAliasBuilder::new(old, live)),
                    )
                    .await
                {
                    warn!(live, error = %restore, "Failed to restore previous alias");
                }
            }
            return Err(e);
        }

        if let Some(old) = previous.filter(|old| old != temp) {
            if let Err(e) = self
                .call("delete_collection", &old, self.client.delete_collection(old.as_str()))
                .await
            {
                warn!(collection = %old, error = %e, "Failed to drop previous collection after swap");
            }
        }

        info!(live, temp, "Swapped collection alias");
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        let response = self
            .call("list_collections", "", self.client.list_collections())
            .await?;
        let aliases = self.aliases().await?;

        // Collections hidden behind an alias are reported by the alias name
        let mut names: Vec<String> = response
            .collections
            .into_iter()
            .map(|c| c.name)
            .filter(|name| !aliases.values().any(|target| target == name))
            .chain(aliases.keys().cloned())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn count(&self, collection: &str) -> Result<usize, StoreError> {
        match self
            .call("count", collection, self.client.collection_info(collection))
            .await
        {
            Ok(info) => Ok(info
                .result
                .and_then(|r| r.points_count)
                .unwrap_or(0) as usize),
            Err(StoreError::CollectionNotFound(_)) => Ok(0),
            Err(e) => Err(e),
        }
    }
}

fn payload_to_qdrant_map(payload: &PointPayload) -> HashMap<String, Value> {
    let mut map = HashMap::new();

    map.insert("file_path".to_string(), Value::from(payload.file_path.clone()));
    map.insert("code".to_string(), Value::from(payload.code.clone()));
    map.insert("language".to_string(), Value::from(payload.language.clone()));
    map.insert("chunk_type".to_string(), Value::from(payload.chunk_type.clone()));
    map.insert("name".to_string(), Value::from(payload.name.clone()));
    map.insert("line_start".to_string(), Value::from(payload.line_start as i64));
    map.insert("line_end".to_string(), Value::from(payload.line_end as i64));
    map.insert("repository".to_string(), Value::from(payload.repository.clone()));

    if let Some(ref sig) = payload.signature {
        map.insert("signature".to_string(), Value::from(sig.clone()));
    }

    map
}

fn qdrant_map_to_payload(map: &HashMap<String, Value>) -> PointPayload {
    PointPayload {
        file_path: extract_string(map.get("file_path")),
        code: extract_string(map.get("code")),
        language: extract_string(map.get("language")),
        chunk_type: extract_string(map.get("chunk_type")),
        name: extract_string(map.get("name")),
        line_start: extract_integer(map.get("line_start")) as usize,
        line_end: extract_integer(map.get("line_end")) as usize,
        repository: extract_string(map.get("repository")),
        signature: map.get("signature").and_then(extract_string_opt),
    }
}

fn extract_string(value: Option<&Value>) -> String {
    value.and_then(extract_string_opt).unwrap_or_default()
}

fn extract_string_opt(value: &Value) -> Option<String> {
    if let Some(Kind::StringValue(s)) = &value.kind {
        Some(s.clone())
    } else {
        None
    }
}

fn extract_integer(value: Option<&Value>) -> i64 {
    value
        .and_then(|v| match &v.kind {
            Some(Kind::IntegerValue(i)) => Some(*i),
            Some(Kind::DoubleValue(d)) => Some(*d as i64),
            _ => None,
        })
        .unwrap_or(0)
}
