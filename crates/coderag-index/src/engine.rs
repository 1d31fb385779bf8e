//! The search engine: one handle over indexing, change processing and
//! hybrid search.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use coderag_config::{Config, VectorBackend};
use ignore::WalkBuilder;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{FileChunkCache, SearchCache, SearchCacheStats};
use crate::chunker::{ChunkType, CodeChunker};
use crate::deps::DependencyGraph;
use crate::embeddings::{provider_from_config, Embedder, EmbeddingCacheStats, EmbeddingProvider};
use crate::incremental::{InFlight, IncrementalIndexer, IndexContext, IndexReport};
use crate::keyword::{Bm25KeywordIndex, KeywordIndex};
use crate::manifest::{content_hash, IndexManifest};
use crate::refactor::{FileChange, GitChange, ProcessReport, RefactorHandler, RollbackPoint};
use crate::reranker::CrossEncoderReranker;
use crate::search::{HybridSearcher, SearchConfig, SearchResult};
use crate::store::{MemoryVectorStore, QdrantStore, SearchFilter, StoreError, VectorStore};

const KEYWORD_FILE: &str = "keyword_index.json";
const MANIFEST_FILE: &str = "manifest.json";
const DEPENDENCIES_FILE: &str = "dependencies.json";

/// Hidden directories that are still indexed.
const VISIBLE_HIDDEN_DIRS: &[&str] = &[".github"];

/// Imports, exports and dependents of one file.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DependencyInfo {
    pub file: String,
    pub imports: Vec<String>,
    pub exports: Vec<String>,
    pub dependents: Vec<String>,
    pub functions: Vec<String>,
    pub classes: Vec<String>,
    pub transitive_imports: Option<Vec<String>>,
    pub transitive_dependents: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatistics {
    pub total_searches: u64,
    pub average_latency_ms: f64,
    pub search_cache: SearchCacheStats,
    pub embedding_cache: EmbeddingCacheStats,
    pub indexed_files: usize,
    pub total_chunks: usize,
    pub last_indexed_at: Option<DateTime<Utc>>,
    pub fallback_embeddings: u64,
    pub dependency_files: usize,
    pub collections: Vec<String>,
}

#[derive(Default)]
struct SearchCounters {
    searches: AtomicU64,
    latency_us: AtomicU64,
    last_indexed: Mutex<Option<DateTime<Utc>>>,
}

impl SearchCounters {
    fn record_search(&self, elapsed: Duration) {
        self.searches.fetch_add(1, Ordering::Relaxed);
        self.latency_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    fn mark_indexed(&self) {
        *self.last_indexed.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
    }

    fn reset(&self) {
        self.searches.store(0, Ordering::Relaxed);
        self.latency_us.store(0, Ordering::Relaxed);
        *self.last_indexed.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Hybrid code search engine over one vector store and keyword index.
pub struct CodeSearchEngine {
    config: Config,
    ctx: Arc<IndexContext>,
    keyword: Arc<Bm25KeywordIndex>,
    searcher: HybridSearcher,
    indexer: IncrementalIndexer,
    refactor: RefactorHandler,
    counters: SearchCounters,
    cancel: Mutex<CancellationToken>,
}

impl CodeSearchEngine {
    /// Build the engine from configuration, connecting the configured
    /// embedding provider and vector store.
    pub fn new(config: Config) -> Result<Self> {
        let provider = provider_from_config(&config.embedding);
        let store: Arc<dyn VectorStore> = match config.vector_store.backend {
            VectorBackend::Qdrant => Arc::new(
                QdrantStore::connect(&config.vector_store)
                    .context("Failed to create vector store client")?,
            ),
            VectorBackend::Memory => Arc::new(MemoryVectorStore::new()),
        };
        Self::with_components(config, provider, store)
    }

    /// Build the engine around an existing provider and store.
    pub fn with_components(
        config: Config,
        provider: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
    ) -> Result<Self> {
        config.validate()?;

        let (keyword, manifest, deps) = if config.indexing.persist {
            let dir = config.data_dir()?;
            let keyword = Bm25KeywordIndex::load(&dir.join(KEYWORD_FILE))
                .context("Failed to load keyword index")?;
            let manifest = IndexManifest::load_or_new(&dir.join(MANIFEST_FILE))
                .context("Failed to load index manifest")?;
            let deps = DependencyGraph::load(&dir.join(DEPENDENCIES_FILE))
                .context("Failed to load dependency graph")?;
            info!(
                data_dir = %dir.display(),
                files = manifest.file_count(),
                "Restored index state"
            );
            (keyword, manifest, deps)
        } else {
            (Bm25KeywordIndex::new(), IndexManifest::new(), DependencyGraph::new())
        };
        let keyword = Arc::new(keyword);

        let embedder = Arc::new(Embedder::new(
            provider,
            config.embedding.cache_size,
            config.embedding.batch_size,
        ));
        let ctx = Arc::new(IndexContext {
            chunker: Arc::new(CodeChunker::new(config.chunking.clone())?),
            embedder: embedder.clone(),
            store: store.clone(),
            keyword: keyword.clone(),
            manifest: Arc::new(RwLock::new(manifest)),
            deps: Arc::new(RwLock::new(deps)),
            search_cache: Arc::new(SearchCache::new(
                config.cache.search_max_entries,
                Duration::from_secs(config.cache.search_ttl_secs),
            )),
            file_cache: Arc::new(FileChunkCache::new(config.cache.file_chunk_max_entries)),
            in_flight: InFlight::new(),
        });

        let mut searcher = HybridSearcher::new(
            SearchConfig::from(&config.search),
            embedder,
            store,
            Some(keyword.clone() as Arc<dyn KeywordIndex>),
        );
        if config.cross_encoder.enabled {
            info!(url = %config.cross_encoder.url, "Cross-encoder reranking enabled");
            searcher = searcher.with_reranker(Arc::new(CrossEncoderReranker::from_config(
                &config.cross_encoder,
            )));
        }

        Ok(Self {
            indexer: IncrementalIndexer::new(ctx.clone(), config.indexing.workers),
            refactor: RefactorHandler::new(ctx.clone(), config.refactor.clone()),
            config,
            ctx,
            keyword,
            searcher,
            counters: SearchCounters::default(),
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn default_collection(&self) -> &str {
        &self.config.indexing.default_collection
    }

    /// Token for the next long-running operation.
    fn operation_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .child_token()
    }

    /// Cancel every indexing or change-processing operation in progress.
    /// Later operations are unaffected.
    pub fn cancel_operations(&self) {
        let mut token = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
        token.cancel();
        *token = CancellationToken::new();
    }

    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        let collection = self.config.indexing.default_collection.clone();
        self.search_in_collection(query, &collection, limit).await
    }

    pub async fn search_in_collection(
        &self,
        query: &str,
        collection: &str,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        self.run_search(query, collection, None, limit).await
    }

    /// Search with metadata conditions. Filtered results are not cached.
    pub async fn search_with_filter(
        &self,
        query: &str,
        collection: &str,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        let filter = (!filter.is_empty()).then_some(filter);
        self.run_search(query, collection, filter, limit).await
    }

    async fn run_search(
        &self,
        query: &str,
        collection: &str,
        filter: Option<&SearchFilter>,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        let start = Instant::now();
        let generation = self.ctx.search_cache.generation(collection);

        if filter.is_none() {
            if let Some(cached) = self.ctx.search_cache.get(query, collection, limit) {
                debug!(query, collection, "Search cache hit");
                self.counters.record_search(start.elapsed());
                return Ok(self.exclude_paths(cached));
            }
        }

        let results = self
            .searcher
            .search(query, collection, limit * 2, filter)
            .await;
        self.counters.record_search(start.elapsed());

        let mut results = self.exclude_paths(results?);
        results.truncate(limit);
        if filter.is_none() {
            self.ctx
                .search_cache
                .insert(query, collection, limit, generation, results.clone());
        }
        Ok(results)
    }

    fn exclude_paths(&self, results: Vec<SearchResult>) -> Vec<SearchResult> {
        let excluded = &self.config.search.excluded_result_paths;
        results
            .into_iter()
            .filter(|r| !excluded.iter().any(|p| r.file_path.contains(p.as_str())))
            .collect()
    }

    pub async fn index_repository(&self, path: &Path, incremental: bool) -> Result<IndexReport> {
        let collection = self.config.indexing.default_collection.clone();
        self.index_repository_to_collection(path, &collection, incremental, false, &[])
            .await
    }

    /// Index the code files under `path` into `collection`.
    ///
    /// Incremental runs re-index only files whose content hash changed.
    /// Files recorded in the manifest but no longer on disk are removed.
    /// `force_clean` drops the collection first and implies a full run.
    pub async fn index_repository_to_collection(
        &self,
        path: &Path,
        collection: &str,
        incremental: bool,
        force_clean: bool,
        exclude_paths: &[String],
    ) -> Result<IndexReport> {
        if !path.is_dir() {
            bail!("Not a directory: {}", path.display());
        }
        let start = Instant::now();
        let cancel = self.operation_token();

        let incremental = incremental && !force_clean;
        if force_clean {
            info!(collection, "Clearing collection before indexing");
            self.drop_collection(collection).await?;
        }
        self.ctx
            .store
            .create_collection(collection, self.ctx.embedder.dimensions())
            .await
            .with_context(|| format!("Failed to prepare collection {}", collection))?;

        let files = self.discover_files(path, exclude_paths)?;
        info!(
            path = %path.display(),
            collection,
            files = files.len(),
            incremental,
            "Indexing repository"
        );

        let current: Vec<String> = files
            .iter()
            .map(|f| f.to_string_lossy().to_string())
            .collect();
        let deleted: Vec<PathBuf> = self
            .ctx
            .manifest
            .read()
            .await
            .find_deleted_files(collection, &current)
            .into_iter()
            .filter(|f| Path::new(f).starts_with(path))
            .map(PathBuf::from)
            .collect();

        let to_index = if incremental {
            self.changed_files(&files, collection).await
        } else {
            files
        };

        let mut report = self.indexer.delete_files(&deleted, collection, &cancel).await?;
        let indexed = self.indexer.index_files(&to_index, collection, &cancel).await?;
        report.merge(&indexed);
        report.duration_ms = start.elapsed().as_millis() as u64;

        self.counters.mark_indexed();
        self.persist_if_enabled().await;
        info!(
            collection,
            indexed = report.indexed,
            deleted = report.deleted,
            failed = report.failed,
            chunks = report.chunks,
            duration_ms = report.duration_ms,
            "Repository indexing complete"
        );
        Ok(report)
    }

    /// Files whose content differs from what the manifest recorded.
    async fn changed_files(&self, files: &[PathBuf], collection: &str) -> Vec<PathBuf> {
        let mut changed = Vec::new();
        for file in files {
            let hash = match tokio::fs::read(file).await {
                Ok(bytes) => content_hash(&bytes),
                Err(e) => {
                    debug!(path = %file.display(), error = %e, "Unreadable, will retry indexing");
                    changed.push(file.clone());
                    continue;
                }
            };
            let manifest = self.ctx.manifest.read().await;
            if manifest.needs_update(collection, &file.to_string_lossy(), &hash) {
                changed.push(file.clone());
            }
        }
        debug!(changed = changed.len(), total = files.len(), "Incremental scan");
        changed
    }

    /// Code files under `root`, honouring .gitignore and the exclude lists.
    pub fn discover_files(&self, root: &Path, exclude_paths: &[String]) -> Result<Vec<PathBuf>> {
        let indexing = &self.config.indexing;
        let exclude_dirs: Vec<String> = indexing.exclude_dirs.clone();
        let excludes: Vec<String> = exclude_paths
            .iter()
            .map(|p| p.trim_end_matches('/').to_string())
            .filter(|p| !p.is_empty())
            .collect();
        let walk_root = root.to_path_buf();

        let walker = WalkBuilder::new(root)
            .hidden(false)
            .git_ignore(indexing.respect_gitignore)
            .git_global(indexing.respect_gitignore)
            .git_exclude(indexing.respect_gitignore)
            .require_git(false)
            .filter_entry(move |entry| {
                if entry.depth() == 0 {
                    return true;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                let is_dir = entry.file_type().map_or(false, |t| t.is_dir());
                if is_dir {
                    if name.starts_with('.') && !VISIBLE_HIDDEN_DIRS.iter().any(|d| *d == name) {
                        return false;
                    }
                    if exclude_dirs.contains(&name) {
                        return false;
                    }
                }
                let relative = entry.path().strip_prefix(&walk_root).unwrap_or(entry.path());
                !excludes
                    .iter()
                    .any(|ex| *ex == name || relative.starts_with(ex))
            })
            .build();

        let mut files = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().map_or(false, |t| t.is_file()) {
                continue;
            }
            let path = entry.path();
            let is_code = path
                .extension()
                .and_then(|e| e.to_str())
                .map_or(false, |ext| {
                    indexing
                        .extensions
                        .iter()
                        .any(|allowed| allowed.eq_ignore_ascii_case(ext))
                });
            if is_code {
                files.push(path.to_path_buf());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Remove `collection` from the store, the keyword index and the
    /// manifest.
    async fn drop_collection(&self, collection: &str) -> Result<()> {
        match self.ctx.store.delete_collection(collection).await {
            Ok(()) | Err(StoreError::CollectionNotFound(_)) => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to drop collection {}", collection))
            }
        }
        if let Err(e) = self.ctx.keyword.delete_collection(collection) {
            debug!(collection, error = %e, "No keyword collection to drop");
        }
        let files = {
            let mut manifest = self.ctx.manifest.write().await;
            let files = manifest.files(collection);
            manifest.clear_collection(collection);
            files
        };
        {
            let mut deps = self.ctx.deps.write().await;
            for file in &files {
                deps.remove_file(file);
            }
        }
        self.ctx.search_cache.invalidate_collection(collection);
        self.ctx.file_cache.clear();
        Ok(())
    }

    pub async fn process_changes(
        &self,
        changes: &[FileChange],
        collection: &str,
    ) -> Result<ProcessReport> {
        let cancel = self.operation_token();
        let report = self
            .refactor
            .process_changes(changes, collection, &cancel)
            .await?;
        self.counters.mark_indexed();
        self.persist_if_enabled().await;
        Ok(report)
    }

    /// Apply changes reported by git. Relative paths are resolved against
    /// `repo_root`.
    pub async fn process_git_changes(
        &self,
        repo_root: &Path,
        changes: Vec<GitChange>,
        collection: &str,
    ) -> Result<ProcessReport> {
        let resolve = |p: PathBuf| if p.is_relative() { repo_root.join(p) } else { p };
        let changes: Vec<FileChange> = changes
            .into_iter()
            .map(|c| {
                let mut change = FileChange::from(c);
                change.path = resolve(change.path);
                change.old_path = change.old_path.map(resolve);
                change
            })
            .collect();
        self.process_changes(&changes, collection).await
    }

    pub async fn rollback(&self, timestamp: DateTime<Utc>) -> Result<ProcessReport> {
        let cancel = self.operation_token();
        let report = self.refactor.rollback(timestamp, &cancel).await?;
        self.counters.mark_indexed();
        self.persist_if_enabled().await;
        Ok(report)
    }

    pub fn rollback_points(&self) -> Vec<RollbackPoint> {
        self.refactor.rollback_points()
    }

    pub fn refactor(&self) -> &RefactorHandler {
        &self.refactor
    }

    pub async fn get_dependencies(&self, path: &Path, transitive: bool) -> Result<DependencyInfo> {
        let file = path.to_string_lossy().to_string();

        let mut functions = BTreeSet::new();
        let mut classes = BTreeSet::new();
        match self.ctx.chunker.chunk_file(path) {
            Ok(chunks) => {
                for chunk in chunks.into_iter().filter(|c| !c.name.is_empty()) {
                    match chunk.chunk_type {
                        ChunkType::Function | ChunkType::Method => {
                            functions.insert(chunk.name);
                        }
                        ChunkType::Type => {
                            classes.insert(chunk.name);
                        }
                        ChunkType::Module | ChunkType::Block => {}
                    }
                }
            }
            Err(e) => debug!(path = %file, error = %e, "Could not chunk file for dependencies"),
        }

        let deps = self.ctx.deps.read().await;
        Ok(DependencyInfo {
            imports: deps.imports(&file, false),
            exports: deps.exports(&file),
            dependents: deps.dependents(&file),
            functions: functions.into_iter().collect(),
            classes: classes.into_iter().collect(),
            transitive_imports: transitive.then(|| deps.imports(&file, true)),
            transitive_dependents: transitive.then(|| deps.transitive_dependents(&file)),
            file,
        })
    }

    /// Drop every indexed collection and reset caches and statistics.
    pub async fn clear_index(&self) -> Result<()> {
        let collections: BTreeSet<String> = {
            let manifest = self.ctx.manifest.read().await;
            manifest
                .collections
                .keys()
                .cloned()
                .chain(self.keyword.collections())
                .collect()
        };
        for collection in &collections {
            match self.ctx.store.delete_collection(collection).await {
                Ok(()) | Err(StoreError::CollectionNotFound(_)) => {}
                Err(e) => warn!(collection = %collection, error = %e, "Failed to delete collection"),
            }
        }

        self.ctx.keyword.clear()?;
        self.ctx.manifest.write().await.clear();
        self.ctx.deps.write().await.clear();
        self.ctx.search_cache.clear();
        self.ctx.file_cache.clear();
        self.ctx.embedder.clear_cache();
        self.counters.reset();
        info!(collections = collections.len(), "Cleared index");

        self.persist_if_enabled().await;
        Ok(())
    }

    pub async fn get_statistics(&self) -> EngineStatistics {
        let searches = self.counters.searches.load(Ordering::Relaxed);
        let latency_us = self.counters.latency_us.load(Ordering::Relaxed);
        let (indexed_files, total_chunks, manifest_collections) = {
            let manifest = self.ctx.manifest.read().await;
            let names: Vec<String> = manifest.collections.keys().cloned().collect();
            (manifest.file_count(), manifest.chunk_count(), names)
        };
        let collections = match self.ctx.store.list_collections().await {
            Ok(names) => names,
            Err(e) => {
                debug!(error = %e, "Listing collections from the manifest instead");
                let mut names = manifest_collections;
                names.sort();
                names
            }
        };

        EngineStatistics {
            total_searches: searches,
            average_latency_ms: if searches == 0 {
                0.0
            } else {
                latency_us as f64 / searches as f64 / 1000.0
            },
            search_cache: self.ctx.search_cache.stats(),
            embedding_cache: self.ctx.embedder.cache_stats(),
            indexed_files,
            total_chunks,
            last_indexed_at: *self
                .counters
                .last_indexed
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
            fallback_embeddings: self.ctx.embedder.fallback_count(),
            dependency_files: self.ctx.deps.read().await.len(),
            collections,
        }
    }

    /// Save the keyword index, manifest and dependency graph under the
    /// data directory.
    pub async fn persist(&self) -> Result<()> {
        let dir = self.config.data_dir()?;
        self.keyword
            .save(&dir.join(KEYWORD_FILE))
            .context("Failed to save keyword index")?;
        self.ctx
            .manifest
            .read()
            .await
            .save(&dir.join(MANIFEST_FILE))
            .context("Failed to save index manifest")?;
        self.ctx
            .deps
            .read()
            .await
            .save(&dir.join(DEPENDENCIES_FILE))
            .context("Failed to save dependency graph")?;
        debug!(data_dir = %dir.display(), "Persisted index state");
        Ok(())
    }

    async fn persist_if_enabled(&self) {
        if !self.config.indexing.persist {
            return;
        }
        if let Err(e) = self.persist().await {
            warn!(error = %e, "Failed to persist index state");
        }
    }
}
