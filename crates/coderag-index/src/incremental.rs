//! Incremental indexing of individual files.
//!
//! Files are processed by a bounded pool of workers. Each worker removes
//! the file's previous documents from both stores, re-chunks and re-embeds
//! it, writes the new chunks and records the result in the manifest.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};

use anyhow::{Context, Result};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{FileChunkCache, SearchCache};
use crate::chunker::{Chunk, CodeChunker};
use crate::deps::DependencyGraph;
use crate::embeddings::Embedder;
use crate::keyword::KeywordIndex;
use crate::manifest::{content_hash, IndexManifest};
use crate::store::{PointPayload, StoreError, VectorPoint, VectorStore};

#[derive(Error, Debug)]
pub enum IndexError {
    /// The vector store could not be reached. Remaining work was aborted.
    #[error("Indexing aborted: {0}")]
    StoreUnavailable(#[source] StoreError),

    #[error("Indexing worker failed: {0}")]
    Worker(String),
}

/// Counts for one `index_files` or `delete_files` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub requested: usize,
    pub indexed: usize,
    pub deleted: usize,
    /// Files not processed: already in flight, not code, or not scheduled
    /// because the call was cancelled
    pub skipped: usize,
    pub failed: usize,
    /// Chunks written
    pub chunks: usize,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl IndexReport {
    pub fn merge(&mut self, other: &IndexReport) {
        self.requested += other.requested;
        self.indexed += other.indexed;
        self.deleted += other.deleted;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.chunks += other.chunks;
        self.cancelled |= other.cancelled;
        self.duration_ms += other.duration_ms;
    }

    /// Files that were handled successfully.
    pub fn processed(&self) -> usize {
        self.indexed + self.deleted
    }
}

/// Set of `(collection, path)` pairs currently being processed.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    paths: Arc<Mutex<HashSet<(String, String)>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `path` as in flight, or `None` when another worker holds it.
    pub fn try_acquire(&self, collection: &str, path: &str) -> Option<InFlightGuard> {
        let key = (collection.to_string(), path.to_string());
        let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
        if !paths.insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard {
            paths: self.paths.clone(),
            key,
        })
    }

    pub fn contains(&self, collection: &str, path: &str) -> bool {
        let paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
        paths.contains(&(collection.to_string(), path.to_string()))
    }

    pub fn len(&self) -> usize {
        self.paths.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases its in-flight entry when dropped, including when the owning
/// task is aborted.
#[derive(Debug)]
pub struct InFlightGuard {
    paths: Arc<Mutex<HashSet<(String, String)>>>,
    key: (String, String),
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
        paths.remove(&self.key);
    }
}

/// Components shared by every indexer of an engine.
pub struct IndexContext {
    pub chunker: Arc<CodeChunker>,
    pub embedder: Arc<Embedder>,
    pub store: Arc<dyn VectorStore>,
    pub keyword: Arc<dyn KeywordIndex>,
    pub manifest: Arc<RwLock<IndexManifest>>,
    pub deps: Arc<RwLock<DependencyGraph>>,
    pub search_cache: Arc<SearchCache>,
    pub file_cache: Arc<FileChunkCache>,
    pub in_flight: InFlight,
}

enum Outcome {
    Indexed { chunks: usize },
    Deleted,
    Skipped,
    Failed,
}

/// Outcome of a store call for one file: fatal errors abort the batch,
/// missing collections are nothing to do, anything else fails the file.
fn check_store(
    result: Result<(), StoreError>,
    path: &str,
    op: &str,
) -> Result<bool, StoreError> {
    match result {
        Ok(()) | Err(StoreError::CollectionNotFound(_)) => Ok(true),
        Err(e) if e.is_unavailable() => Err(e),
        Err(e) => {
            warn!(path, error = %e, "Vector store {} failed", op);
            Ok(false)
        }
    }
}

fn dedup_paths(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    paths
        .iter()
        .filter(|p| seen.insert(p.as_path()))
        .cloned()
        .collect()
}

/// Indexes and deletes files with a bounded worker pool.
#[derive(Clone)]
pub struct IncrementalIndexer {
    ctx: Arc<IndexContext>,
    workers: usize,
    update_deps: bool,
}

impl IncrementalIndexer {
    pub fn new(ctx: Arc<IndexContext>, workers: usize) -> Self {
        Self {
            ctx,
            workers: workers.max(1),
            update_deps: true,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Leave the dependency graph untouched; the caller rebuilds it.
    pub fn without_dependency_updates(mut self) -> Self {
        self.update_deps = false;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Re-index created or modified files.
    pub async fn index_files(
        &self,
        paths: &[PathBuf],
        collection: &str,
        cancel: &CancellationToken,
    ) -> Result<IndexReport> {
        self.run(paths, collection, cancel, false).await
    }

    /// Remove deleted files from both stores and the manifest.
    pub async fn delete_files(
        &self,
        paths: &[PathBuf],
        collection: &str,
        cancel: &CancellationToken,
    ) -> Result<IndexReport> {
        self.run(paths, collection, cancel, true).await
    }

    async fn run(
        &self,
        paths: &[PathBuf],
        collection: &str,
        cancel: &CancellationToken,
        delete: bool,
    ) -> Result<IndexReport> {
        let start = Instant::now();
        let paths = dedup_paths(paths);
        let mut report = IndexReport {
            requested: paths.len(),
            ..Default::default()
        };
        if paths.is_empty() {
            return Ok(report);
        }

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let abort = cancel.child_token();
        let mut tasks: JoinSet<Result<Outcome, StoreError>> = JoinSet::new();
        let mut scheduled = 0usize;

        for path in paths.iter().cloned() {
            let permit = tokio::select! {
                biased;
                _ = abort.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => {
                    permit.context("Indexing worker pool closed")?
                }
            };
            scheduled += 1;

            let ctx = self.ctx.clone();
            let collection = collection.to_string();
            let abort = abort.clone();
            let update_deps = self.update_deps;
            tasks.spawn(async move {
                let _permit = permit;
                let result = if delete {
                    delete_one(&ctx, &collection, &path, update_deps).await
                } else {
                    index_one(&ctx, &collection, &path, update_deps).await
                };
                if result.is_err() {
                    abort.cancel();
                }
                result
            });
        }

        let mut fatal: Option<StoreError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(Outcome::Indexed { chunks })) => {
                    report.indexed += 1;
                    report.chunks += chunks;
                }
                Ok(Ok(Outcome::Deleted)) => report.deleted += 1,
                Ok(Ok(Outcome::Skipped)) => report.skipped += 1,
                Ok(Ok(Outcome::Failed)) => report.failed += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    if fatal.is_none() {
                        tasks.abort_all();
                        fatal = Some(e);
                    }
                }
                Err(e) if e.is_cancelled() => report.skipped += 1,
                Err(e) => {
                    warn!(error = %e, "Indexing task panicked");
                    report.failed += 1;
                }
            }
        }

        if report.indexed + report.deleted > 0 {
            self.ctx.search_cache.invalidate_collection(collection);
        }
        report.skipped += paths.len() - scheduled;
        report.cancelled = cancel.is_cancelled();
        report.duration_ms = start.elapsed().as_millis() as u64;

        if let Some(e) = fatal {
            warn!(collection, error = %e, "Vector store unavailable, aborting indexing");
            return Err(IndexError::StoreUnavailable(e).into());
        }

        if delete {
            debug!(collection, ?report, "Deleted files");
        } else {
            info!(
                collection,
                indexed = report.indexed,
                failed = report.failed,
                skipped = report.skipped,
                chunks = report.chunks,
                "Indexed files"
            );
        }
        Ok(report)
    }
}

fn modified_time(meta: &std::fs::Metadata) -> SystemTime {
    meta.modified().unwrap_or(SystemTime::UNIX_EPOCH)
}

fn chunks_for(
    ctx: &IndexContext,
    path: &Path,
    path_str: &str,
    language: &str,
    text: &str,
    mtime: SystemTime,
    hash: &str,
) -> Vec<Chunk> {
    if let Some(chunks) = ctx.file_cache.get(path, mtime, hash) {
        return chunks;
    }
    let chunks = ctx.chunker.chunk_source(text, path_str, language);
    ctx.file_cache.insert(path, mtime, hash, chunks.clone());
    chunks
}

/// Remove the documents previously written for `path`, except the ids in
/// `keep`, which are about to be overwritten.
async fn remove_previous(
    ctx: &IndexContext,
    collection: &str,
    path: &str,
    keep: &HashSet<&str>,
) -> Result<bool, StoreError> {
    let previous = ctx
        .manifest
        .read()
        .await
        .file(collection, path)
        .map(|s| s.chunk_ids.clone());

    match previous {
        Some(ids) => {
            let stale: Vec<String> = ids
                .into_iter()
                .filter(|id| !keep.contains(id.as_str()))
                .collect();
            if stale.is_empty() {
                return Ok(true);
            }
            let ok = check_store(ctx.store.delete(collection, &stale).await, path, "delete")?;
            if let Err(e) = ctx.keyword.delete_chunks(collection, &stale) {
                warn!(path, error = %e, "Keyword index delete failed");
            }
            Ok(ok)
        }
        None => {
            let ok = check_store(ctx.store.delete_file(collection, path).await, path, "delete")?;
            if let Err(e) = ctx.keyword.delete_file(collection, path) {
                warn!(path, error = %e, "Keyword index delete failed");
            }
            Ok(ok)
        }
    }
}

async fn index_one(
    ctx: &IndexContext,
    collection: &str,
    path: &Path,
    update_deps: bool,
) -> Result<Outcome, StoreError> {
    let path_str = path.to_string_lossy().to_string();
    let Some(_guard) = ctx.in_flight.try_acquire(collection, &path_str) else {
        debug!(path = %path_str, "Already being indexed, skipping");
        return Ok(Outcome::Skipped);
    };

    let Some(language) = CodeChunker::detect_language(path) else {
        debug!(path = %path_str, "Not a code file, skipping");
        return Ok(Outcome::Skipped);
    };

    let (bytes, mtime) = match tokio::fs::read(path).await {
        Ok(bytes) => {
            let mtime = tokio::fs::metadata(path)
                .await
                .map(|m| modified_time(&m))
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (bytes, mtime)
        }
        Err(e) => {
            warn!(path = %path_str, error = %e, "Failed to read file");
            return Ok(Outcome::Failed);
        }
    };
    let hash = content_hash(&bytes);
    let text = String::from_utf8_lossy(&bytes).into_owned();

    let mut chunks = chunks_for(ctx, path, &path_str, language, &text, mtime, &hash);
    for chunk in &mut chunks {
        chunk.repository = collection.to_string();
    }
    let ids: Vec<String> = chunks.iter().map(Chunk::id).collect();
    let keep: HashSet<&str> = ids.iter().map(String::as_str).collect();

    if !remove_previous(ctx, collection, &path_str, &keep).await? {
        return Ok(Outcome::Failed);
    }

    if !chunks.is_empty() {
        let items: Vec<(String, String)> = chunks
            .iter()
            .map(|c| (c.embedding_text(), c.language.clone()))
            .collect();
        let vectors = match ctx.embedder.embed_code_batch(&items).await {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %path_str, error = %e, "Embedding failed");
                return Ok(Outcome::Failed);
            }
        };

        let points: Vec<VectorPoint> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| VectorPoint {
                id: chunk.id(),
                vector,
                payload: PointPayload::from_chunk(chunk),
            })
            .collect();
        if !check_store(ctx.store.upsert(collection, points).await, &path_str, "upsert")? {
            return Ok(Outcome::Failed);
        }

        if let Err(e) = ctx.keyword.index_chunks(collection, &chunks) {
            warn!(path = %path_str, error = %e, "Keyword indexing failed");
        }
    }

    ctx.manifest
        .write()
        .await
        .record_indexed(collection, &path_str, hash, ids);

    if update_deps {
        ctx.deps.write().await.analyze_file(&path_str, &text);
    }

    debug!(path = %path_str, chunks = chunks.len(), "Indexed file");
    Ok(Outcome::Indexed {
        chunks: chunks.len(),
    })
}

async fn delete_one(
    ctx: &IndexContext,
    collection: &str,
    path: &Path,
    update_deps: bool,
) -> Result<Outcome, StoreError> {
    let path_str = path.to_string_lossy().to_string();
    let Some(_guard) = ctx.in_flight.try_acquire(collection, &path_str) else {
        return Ok(Outcome::Skipped);
    };

    if !remove_previous(ctx, collection, &path_str, &HashSet::new()).await? {
        return Ok(Outcome::Failed);
    }
    ctx.manifest.write().await.remove_file(collection, &path_str);
    if update_deps {
        ctx.deps.write().await.remove_file(&path_str);
    }
    ctx.file_cache.invalidate(&[path]);

    debug!(path = %path_str, "Deleted file from index");
    Ok(Outcome::Deleted)
}

/// Rebuild the dependency graph from the files indexed into `collection`.
pub async fn rebuild_dependencies(ctx: &IndexContext, collection: &str) -> usize {
    let files = ctx.manifest.read().await.files(collection);
    let mut contents: HashMap<String, String> = HashMap::new();
    for file in files {
        match tokio::fs::read(&file).await {
            Ok(bytes) => {
                contents.insert(file, String::from_utf8_lossy(&bytes).into_owned());
            }
            Err(e) => debug!(path = %file, error = %e, "Skipping dependency analysis"),
        }
    }

    let mut deps = ctx.deps.write().await;
    deps.clear();
    for (file, content) in &contents {
        deps.analyze_file(file, content);
    }
    info!(collection, files = contents.len(), "Rebuilt dependency graph");
    contents.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{EmbeddingProvider, HashEmbeddings};
    use crate::keyword::Bm25KeywordIndex;
    use crate::search::SearchResult;
    use crate::store::{MemoryVectorStore, SearchFilter, VectorHit};
    use async_trait::async_trait;
    use std::time::Duration;

    fn context_with(store: Arc<dyn VectorStore>) -> Arc<IndexContext> {
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbeddings::new(32));
        Arc::new(IndexContext {
            chunker: Arc::new(CodeChunker::with_defaults().unwrap()),
            embedder: Arc::new(Embedder::new(provider, 1000, 16)),
            store,
            keyword: Arc::new(Bm25KeywordIndex::new()),
            manifest: Arc::new(RwLock::new(IndexManifest::new())),
            deps: Arc::new(RwLock::new(DependencyGraph::new())),
            search_cache: Arc::new(SearchCache::new(100, Duration::from_secs(60))),
            file_cache: Arc::new(FileChunkCache::new(100)),
            in_flight: InFlight::new(),
        })
    }

    fn go_file(dir: &Path, name: &str, funcs: &[&str]) -> PathBuf {
        let mut source = String::from("package main\n\n");
        for f in funcs {
            source.push_str(&format!(
                "func {}(input string) string {{\n\treturn input + \"{}\"\n}}\n\n",
                f, f
            ));
        }
        let path = dir.join(name);
        std::fs::write(&path, source).unwrap();
        path
    }

    struct DownStore;

    #[async_trait]
    impl VectorStore for DownStore {
        async fn create_collection(&self, _: &str, _: usize) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("refused".into()))
        }
        async fn upsert(&self, _: &str, _: Vec<VectorPoint>) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("refused".into()))
        }
        async fn search(
            &self,
            _: &str,
            _: &[f32],
            _: usize,
            _: Option<&SearchFilter>,
        ) -> Result<Vec<VectorHit>, StoreError> {
            Err(StoreError::Unavailable("refused".into()))
        }
        async fn delete(&self, _: &str, _: &[String]) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("refused".into()))
        }
        async fn delete_file(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("refused".into()))
        }
        async fn delete_collection(&self, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("refused".into()))
        }
        async fn swap_collection(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("refused".into()))
        }
        async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Unavailable("refused".into()))
        }
        async fn count(&self, _: &str) -> Result<usize, StoreError> {
            Err(StoreError::Unavailable("refused".into()))
        }
    }

    #[test]
    fn test_in_flight_guard_releases_on_drop() {
        let in_flight = InFlight::new();
        let guard = in_flight.try_acquire("code", "a.go").unwrap();
        assert!(in_flight.try_acquire("code", "a.go").is_none());
        assert!(in_flight.try_acquire("other", "a.go").is_some());
        assert!(in_flight.contains("code", "a.go"));

        drop(guard);
        assert!(in_flight.is_empty());
        assert!(in_flight.try_acquire("code", "a.go").is_some());
    }

    #[tokio::test]
    async fn test_index_files_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let file = go_file(dir.path(), "main.go", &["Alpha", "Beta"]);
        let store = Arc::new(MemoryVectorStore::new());
        let ctx = context_with(store.clone());
        let indexer = IncrementalIndexer::new(ctx.clone(), 4);
        let cancel = CancellationToken::new();

        let first = indexer.index_files(&[file.clone()], "code", &cancel).await.unwrap();
        assert_eq!(first.indexed, 1);
        let ids_before = ctx
            .manifest
            .read()
            .await
            .file("code", &file.to_string_lossy())
            .unwrap()
            .chunk_ids
            .clone();
        let points_before = store.count("code").await.unwrap();
        let docs_before = ctx.keyword.count("code");

        indexer.index_files(&[file.clone()], "code", &cancel).await.unwrap();
        let ids_after = ctx
            .manifest
            .read()
            .await
            .file("code", &file.to_string_lossy())
            .unwrap()
            .chunk_ids
            .clone();

        assert_eq!(ids_before, ids_after);
        assert_eq!(store.count("code").await.unwrap(), points_before);
        assert_eq!(ctx.keyword.count("code"), docs_before);
        assert!(points_before >= 2);
    }

    #[tokio::test]
    async fn test_modify_removes_stale_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let file = go_file(dir.path(), "main.go", &["Alpha", "Beta", "Gamma"]);
        let store = Arc::new(MemoryVectorStore::new());
        let ctx = context_with(store.clone());
        let indexer = IncrementalIndexer::new(ctx.clone(), 2);
        let cancel = CancellationToken::new();

        indexer.index_files(&[file.clone()], "code", &cancel).await.unwrap();
        let before = store.count("code").await.unwrap();

        go_file(dir.path(), "main.go", &["Alpha"]);
        indexer.index_files(&[file.clone()], "code", &cancel).await.unwrap();

        assert!(store.count("code").await.unwrap() < before);
        let found: Vec<SearchResult> = ctx.keyword.search("Gamma", "code", 10).unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_rewrite_with_preserved_mtime_is_reindexed() {
        let dir = tempfile::tempdir().unwrap();
        let file = go_file(dir.path(), "main.go", &["Alpha"]);
        let mtime = std::fs::metadata(&file).unwrap().modified().unwrap();
        let ctx = context_with(Arc::new(MemoryVectorStore::new()));
        let indexer = IncrementalIndexer::new(ctx.clone(), 1);
        let cancel = CancellationToken::new();
        indexer.index_files(&[file.clone()], "code", &cancel).await.unwrap();

        go_file(dir.path(), "main.go", &["Omega"]);
        std::fs::File::options()
            .write(true)
            .open(&file)
            .unwrap()
            .set_modified(mtime)
            .unwrap();
        assert_eq!(std::fs::metadata(&file).unwrap().modified().unwrap(), mtime);

        let report = indexer.index_files(&[file.clone()], "code", &cancel).await.unwrap();
        assert_eq!(report.indexed, 1);
        assert!(!ctx.keyword.search("Omega", "code", 10).unwrap().is_empty());
        assert!(ctx.keyword.search("Alpha", "code", 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_files_removes_exactly_file_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let keep = go_file(dir.path(), "keep.go", &["Keep"]);
        let gone = go_file(dir.path(), "gone.go", &["One", "Two", "Three", "Four"]);
        let store = Arc::new(MemoryVectorStore::new());
        let ctx = context_with(store.clone());
        let indexer = IncrementalIndexer::new(ctx.clone(), 4);
        let cancel = CancellationToken::new();

        indexer
            .index_files(&[keep.clone(), gone.clone()], "code", &cancel)
            .await
            .unwrap();
        let gone_chunks = ctx
            .manifest
            .read()
            .await
            .file("code", &gone.to_string_lossy())
            .unwrap()
            .chunk_ids
            .len();
        assert_eq!(gone_chunks, 4);
        let points = store.count("code").await.unwrap();
        let docs = ctx.keyword.count("code");

        let report = indexer.delete_files(&[gone.clone()], "code", &cancel).await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(store.count("code").await.unwrap(), points - 4);
        assert_eq!(ctx.keyword.count("code"), docs - 4);
        assert!(ctx.manifest.read().await.file("code", &gone.to_string_lossy()).is_none());
    }

    #[tokio::test]
    async fn test_failures_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let good = go_file(dir.path(), "good.go", &["Good"]);
        let missing = dir.path().join("missing.go");
        let notes = dir.path().join("notes.txt");
        std::fs::write(&notes, "not code").unwrap();

        let ctx = context_with(Arc::new(MemoryVectorStore::new()));
        let indexer = IncrementalIndexer::new(ctx, 2);
        let report = indexer
            .index_files(&[good, missing, notes], "code", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.requested, 3);
        assert_eq!(report.indexed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_store_unavailable_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let files: Vec<PathBuf> = (0..5)
            .map(|i| go_file(dir.path(), &format!("f{}.go", i), &["F"]))
            .collect();
        let ctx = context_with(Arc::new(DownStore));
        let indexer = IncrementalIndexer::new(ctx.clone(), 1);

        let err = indexer
            .index_files(&files, "code", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IndexError>(),
            Some(IndexError::StoreUnavailable(_))
        ));
        assert!(ctx.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_schedules_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let file = go_file(dir.path(), "a.go", &["A"]);
        let ctx = context_with(Arc::new(MemoryVectorStore::new()));
        let indexer = IncrementalIndexer::new(ctx, 2);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = indexer.index_files(&[file], "code", &cancel).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.indexed, 0);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_in_flight_path_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let file = go_file(dir.path(), "a.go", &["A"]);
        let ctx = context_with(Arc::new(MemoryVectorStore::new()));
        let _held = ctx
            .in_flight
            .try_acquire("code", &file.to_string_lossy())
            .unwrap();

        let indexer = IncrementalIndexer::new(ctx, 2);
        let report = indexer
            .index_files(&[file], "code", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.indexed, 0);
    }

    #[tokio::test]
    async fn test_dependencies_updated_and_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.js");
        let b = dir.path().join("b.js");
        std::fs::write(&a, "import { b } from './b.js';\nexport function a() { return b(); }\n").unwrap();
        std::fs::write(&b, "export function b() { return 1; }\n").unwrap();

        let ctx = context_with(Arc::new(MemoryVectorStore::new()));
        let indexer = IncrementalIndexer::new(ctx.clone(), 2);
        indexer
            .index_files(&[a.clone(), b.clone()], "code", &CancellationToken::new())
            .await
            .unwrap();

        let b_str = b.to_string_lossy().to_string();
        let a_str = a.to_string_lossy().to_string();
        assert_eq!(ctx.deps.read().await.dependents(&b_str), vec![a_str.clone()]);

        ctx.deps.write().await.clear();
        assert_eq!(rebuild_dependencies(&ctx, "code").await, 2);
        assert_eq!(ctx.deps.read().await.dependents(&b_str), vec![a_str]);
    }

    #[tokio::test]
    async fn test_duplicate_paths_processed_once() {
        let dir = tempfile::tempdir().unwrap();
        let file = go_file(dir.path(), "a.go", &["A"]);
        let ctx = context_with(Arc::new(MemoryVectorStore::new()));
        let indexer = IncrementalIndexer::new(ctx, 2);
        let report = indexer
            .index_files(&[file.clone(), file], "code", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.requested, 1);
        assert_eq!(report.indexed, 1);
    }
}
