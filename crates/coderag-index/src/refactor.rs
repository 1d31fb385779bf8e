//! Adaptive processing of change sets, from single edits to
//! repository-wide refactors.
//!
//! The size of a change set picks a [`ProcessingMode`]. Small sets are
//! applied one change at a time; larger ones are applied in delayed,
//! concurrent batches; the largest are rebuilt into a temporary collection
//! and swapped in once complete.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use coderag_config::{ModeSettings, RefactorConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::incremental::{rebuild_dependencies, IncrementalIndexer, IndexContext, IndexReport};

#[derive(Error, Debug)]
pub enum RefactorError {
    #[error("No rollback point at or before {0}")]
    RollbackNotFound(DateTime<Utc>),

    #[error("Change processing cancelled")]
    Cancelled,

    #[error("Failed to swap {temp} into {live}: {reason}")]
    SwapFailed {
        live: String,
        temp: String,
        reason: String,
    },
}

/// Processing strategy, chosen by change-set size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    Realtime,
    Batch,
    Bulk,
    Offline,
}

impl ProcessingMode {
    pub fn classify(change_count: usize, config: &RefactorConfig) -> Self {
        if change_count < config.realtime_below {
            ProcessingMode::Realtime
        } else if change_count < config.batch_below {
            ProcessingMode::Batch
        } else if change_count < config.bulk_below {
            ProcessingMode::Bulk
        } else {
            ProcessingMode::Offline
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingMode::Realtime => "realtime",
            ProcessingMode::Batch => "batch",
            ProcessingMode::Bulk => "bulk",
            ProcessingMode::Offline => "offline",
        }
    }

    fn settings(self, config: &RefactorConfig) -> ModeSettings {
        match self {
            ProcessingMode::Realtime => ModeSettings {
                batch_size: 1,
                concurrency: 1,
                delay_ms: 0,
            },
            ProcessingMode::Batch => config.batch,
            ProcessingMode::Bulk => config.bulk,
            ProcessingMode::Offline => config.offline,
        }
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Modify,
    Delete,
    Rename,
}

/// A file change reported by a watcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: PathBuf,
    /// Previous path, for renames
    pub old_path: Option<PathBuf>,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub content_hash: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl FileChange {
    pub fn new(path: impl Into<PathBuf>, change_type: ChangeType) -> Self {
        Self {
            path: path.into(),
            old_path: None,
            change_type,
            content_hash: None,
            timestamp: Utc::now(),
        }
    }

    pub fn rename(old_path: impl Into<PathBuf>, path: impl Into<PathBuf>) -> Self {
        Self {
            old_path: Some(old_path.into()),
            ..Self::new(path, ChangeType::Rename)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitStatus {
    Untracked,
    Modified,
    Added,
    Deleted,
    Renamed,
    Copied,
}

/// A working-tree change reported by git.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitChange {
    pub path: PathBuf,
    pub status: GitStatus,
    pub old_path: Option<PathBuf>,
}

impl From<GitChange> for FileChange {
    fn from(change: GitChange) -> Self {
        let change_type = match change.status {
            GitStatus::Untracked | GitStatus::Added | GitStatus::Copied => ChangeType::Create,
            GitStatus::Modified => ChangeType::Modify,
            GitStatus::Deleted => ChangeType::Delete,
            GitStatus::Renamed => ChangeType::Rename,
        };
        FileChange {
            old_path: change.old_path,
            ..FileChange::new(change.path, change_type)
        }
    }
}

/// Files that were about to change, kept so they can be re-indexed later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackPoint {
    pub timestamp: DateTime<Utc>,
    pub files: Vec<PathBuf>,
    pub collection: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessReport {
    pub mode: ProcessingMode,
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    /// Changes to files that are not indexed, such as non-code files
    pub skipped: usize,
    /// Dependents re-indexed or invalidated because an import changed
    pub dependents: usize,
    pub duration: Duration,
    pub submitted: Vec<PathBuf>,
}

/// Snapshot of the running (or last) operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefactorProgress {
    pub mode: Option<ProcessingMode>,
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    pub elapsed: Duration,
    pub files_per_sec: f64,
    pub eta: Option<Duration>,
}

#[derive(Default)]
struct ProgressCounters {
    total: AtomicUsize,
    processed: AtomicUsize,
    failed: AtomicUsize,
    started: Mutex<Option<(Instant, ProcessingMode)>>,
}

impl ProgressCounters {
    fn start(&self, total: usize, mode: ProcessingMode) {
        self.total.store(total, Ordering::SeqCst);
        self.processed.store(0, Ordering::SeqCst);
        self.failed.store(0, Ordering::SeqCst);
        *self.started.lock().unwrap_or_else(|e| e.into_inner()) = Some((Instant::now(), mode));
    }

    fn record(&self, processed: usize, failed: usize) {
        self.processed.fetch_add(processed, Ordering::SeqCst);
        self.failed.fetch_add(failed, Ordering::SeqCst);
    }

    fn snapshot(&self) -> RefactorProgress {
        let started = *self.started.lock().unwrap_or_else(|e| e.into_inner());
        let total = self.total.load(Ordering::SeqCst);
        let processed = self.processed.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);

        let elapsed = started.map(|(at, _)| at.elapsed()).unwrap_or_default();
        let secs = elapsed.as_secs_f64();
        let files_per_sec = if secs > 0.0 { processed as f64 / secs } else { 0.0 };
        let remaining = total.saturating_sub(processed + failed);
        let eta = (files_per_sec > 0.0)
            .then(|| Duration::from_secs_f64(remaining as f64 / files_per_sec));

        RefactorProgress {
            mode: started.map(|(_, mode)| mode),
            total,
            processed,
            failed,
            elapsed,
            files_per_sec,
            eta,
        }
    }

    fn log(&self, done: bool) {
        let p = self.snapshot();
        let percent = if p.total == 0 {
            100.0
        } else {
            p.processed as f64 / p.total as f64 * 100.0
        };
        if done {
            info!(
                processed = p.processed,
                total = p.total,
                failed = p.failed,
                files_per_sec = p.files_per_sec,
                elapsed = ?p.elapsed,
                "Processing complete ({:.1}%)",
                percent
            );
        } else {
            info!(
                processed = p.processed,
                total = p.total,
                failed = p.failed,
                files_per_sec = p.files_per_sec,
                eta = ?p.eta,
                "Progress ({:.1}%)",
                percent
            );
        }
    }
}

/// Paths touched by a slice of changes, split by operation.
#[derive(Default)]
struct ChangePlan {
    deletes: Vec<PathBuf>,
    renamed_from: Vec<PathBuf>,
    indexes: Vec<PathBuf>,
}

impl ChangePlan {
    fn new(changes: &[FileChange]) -> Self {
        let mut plan = ChangePlan::default();
        for change in changes {
            match change.change_type {
                ChangeType::Delete => plan.deletes.push(change.path.clone()),
                ChangeType::Create | ChangeType::Modify => plan.indexes.push(change.path.clone()),
                ChangeType::Rename => {
                    if let Some(old) = &change.old_path {
                        plan.renamed_from.push(old.clone());
                    }
                    plan.indexes.push(change.path.clone());
                }
            }
        }
        plan
    }
}

/// Totals of applying changes.
#[derive(Default)]
struct Applied {
    processed: usize,
    failed: usize,
    skipped: usize,
}

impl Applied {
    fn add(&mut self, deleted: &IndexReport, indexed: &IndexReport) {
        self.processed += deleted.deleted + indexed.indexed;
        self.failed += deleted.failed + indexed.failed;
        self.skipped += deleted.skipped + indexed.skipped;
    }
}

/// Applies change sets to a collection with a strategy chosen by size.
pub struct RefactorHandler {
    ctx: Arc<IndexContext>,
    config: RefactorConfig,
    rollback_points: Mutex<VecDeque<RollbackPoint>>,
    progress: ProgressCounters,
    run_lock: tokio::sync::Mutex<()>,
}

impl RefactorHandler {
    pub fn new(ctx: Arc<IndexContext>, config: RefactorConfig) -> Self {
        Self {
            ctx,
            config,
            rollback_points: Mutex::new(VecDeque::new()),
            progress: ProgressCounters::default(),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn mode_for(&self, change_count: usize) -> ProcessingMode {
        ProcessingMode::classify(change_count, &self.config)
    }

    pub fn progress(&self) -> RefactorProgress {
        self.progress.snapshot()
    }

    /// Retained rollback points, oldest first.
    pub fn rollback_points(&self) -> Vec<RollbackPoint> {
        self.rollback_points
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub async fn process_changes(
        &self,
        changes: &[FileChange],
        collection: &str,
        cancel: &CancellationToken,
    ) -> Result<ProcessReport> {
        let mode = self.mode_for(changes.len());
        self.run(changes, collection, mode, true, cancel).await
    }

    /// Re-index the files of the latest rollback point recorded at or
    /// before `timestamp`, with their current on-disk content.
    pub async fn rollback(
        &self,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<ProcessReport> {
        let point = {
            let points = self.rollback_points.lock().unwrap_or_else(|e| e.into_inner());
            points
                .iter()
                .rev()
                .find(|p| p.timestamp <= timestamp)
                .cloned()
        };
        let Some(point) = point else {
            return Err(RefactorError::RollbackNotFound(timestamp).into());
        };

        warn!(
            timestamp = %point.timestamp,
            files = point.files.len(),
            collection = %point.collection,
            "Rolling back"
        );
        let changes: Vec<FileChange> = point
            .files
            .iter()
            .map(|f| FileChange::new(f.clone(), ChangeType::Modify))
            .collect();
        self.run(&changes, &point.collection, ProcessingMode::Batch, false, cancel)
            .await
    }

    async fn run(
        &self,
        changes: &[FileChange],
        collection: &str,
        mode: ProcessingMode,
        record_rollback: bool,
        cancel: &CancellationToken,
    ) -> Result<ProcessReport> {
        let _running = self.run_lock.lock().await;
        let start = Instant::now();

        info!(changes = changes.len(), mode = %mode, collection, "Processing changes");
        self.progress.start(changes.len(), mode);

        if record_rollback && changes.len() > self.config.rollback_threshold {
            self.record_rollback_point(changes, collection);
        }

        let (applied, dependents) = match mode {
            ProcessingMode::Realtime => self.process_realtime(changes, collection, cancel).await?,
            ProcessingMode::Batch => self.process_batch(changes, collection, cancel).await?,
            ProcessingMode::Bulk => self.process_bulk(changes, collection, cancel).await?,
            ProcessingMode::Offline => self.process_offline(changes, collection, cancel).await?,
        };
        self.progress.log(true);

        Ok(ProcessReport {
            mode,
            total: changes.len(),
            processed: applied.processed,
            failed: applied.failed,
            skipped: applied.skipped,
            dependents,
            duration: start.elapsed(),
            submitted: changes.iter().map(|c| c.path.clone()).collect(),
        })
    }

    fn record_rollback_point(&self, changes: &[FileChange], collection: &str) {
        let point = RollbackPoint {
            timestamp: Utc::now(),
            files: changes.iter().map(|c| c.path.clone()).collect(),
            collection: collection.to_string(),
        };
        info!(
            timestamp = %point.timestamp,
            files = point.files.len(),
            "Created rollback point"
        );

        let max = self.config.max_rollback_points.max(1);
        let mut points = self.rollback_points.lock().unwrap_or_else(|e| e.into_inner());
        while points.len() >= max {
            points.pop_front();
        }
        points.push_back(point);
    }

    fn indexer(&self, settings: &ModeSettings) -> IncrementalIndexer {
        IncrementalIndexer::new(self.ctx.clone(), settings.concurrency)
    }

    /// Apply one slice of changes: deletions first, then (re)indexing.
    async fn apply(
        &self,
        indexer: &IncrementalIndexer,
        changes: &[FileChange],
        collection: &str,
        cancel: &CancellationToken,
    ) -> Result<Applied> {
        let plan = ChangePlan::new(changes);
        let mut applied = Applied::default();

        let deleted = indexer.delete_files(&plan.deletes, collection, cancel).await?;
        let renamed = indexer
            .delete_files(&plan.renamed_from, collection, cancel)
            .await?;
        if renamed.failed > 0 {
            warn!(failed = renamed.failed, "Failed to remove renamed files");
        }
        let indexed = indexer.index_files(&plan.indexes, collection, cancel).await?;

        applied.add(&deleted, &indexed);
        self.progress.record(
            deleted.deleted + indexed.indexed + deleted.skipped + indexed.skipped,
            deleted.failed + indexed.failed,
        );
        Ok(applied)
    }

    async fn dependents_of(&self, changes: &[FileChange]) -> BTreeSet<String> {
        let changed: HashSet<String> = changes
            .iter()
            .map(|c| c.path.to_string_lossy().to_string())
            .collect();
        let deps = self.ctx.deps.read().await;
        changes
            .iter()
            .filter(|c| c.change_type != ChangeType::Delete)
            .flat_map(|c| deps.dependents(&c.path.to_string_lossy()))
            .filter(|d| !changed.contains(d))
            .collect()
    }

    async fn process_realtime(
        &self,
        changes: &[FileChange],
        collection: &str,
        cancel: &CancellationToken,
    ) -> Result<(Applied, usize)> {
        let indexer = IncrementalIndexer::new(self.ctx.clone(), 1);
        let mut applied = Applied::default();
        let mut reindexed = 0;

        for change in changes {
            if cancel.is_cancelled() {
                return Err(RefactorError::Cancelled.into());
            }
            let result = self
                .apply(&indexer, std::slice::from_ref(change), collection, cancel)
                .await?;
            applied.processed += result.processed;
            applied.failed += result.failed;
            applied.skipped += result.skipped;

            if change.change_type == ChangeType::Delete {
                continue;
            }
            let dependents: Vec<PathBuf> = self
                .dependents_of(std::slice::from_ref(change))
                .await
                .into_iter()
                .map(PathBuf::from)
                .filter(|p| p.exists())
                .collect();
            if dependents.is_empty() {
                continue;
            }
            debug!(
                path = %change.path.display(),
                dependents = dependents.len(),
                "Re-indexing dependents"
            );
            self.ctx.file_cache.invalidate(&dependents);
            let report = indexer.index_files(&dependents, collection, cancel).await?;
            reindexed += report.indexed;
        }
        Ok((applied, reindexed))
    }

    /// Apply `changes` in batches with the mode's size, concurrency and
    /// delay. Returns early with `Cancelled` when the token fires.
    async fn process_in_batches(
        &self,
        indexer: &IncrementalIndexer,
        changes: &[FileChange],
        collection: &str,
        settings: &ModeSettings,
        label: &str,
        cancel: &CancellationToken,
    ) -> Result<Applied> {
        let batches: Vec<&[FileChange]> = changes.chunks(settings.batch_size.max(1)).collect();
        let mut applied = Applied::default();

        for (i, batch) in batches.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(RefactorError::Cancelled.into());
            }
            info!(
                batch = i + 1,
                batches = batches.len(),
                files = batch.len(),
                "{} batch",
                label
            );
            let result = self.apply(indexer, batch, collection, cancel).await?;
            applied.processed += result.processed;
            applied.failed += result.failed;
            applied.skipped += result.skipped;
            self.progress.log(false);

            if i + 1 < batches.len() && settings.delay_ms > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RefactorError::Cancelled.into()),
                    _ = tokio::time::sleep(Duration::from_millis(settings.delay_ms)) => {}
                }
            }
        }
        if cancel.is_cancelled() {
            return Err(RefactorError::Cancelled.into());
        }
        Ok(applied)
    }

    async fn process_batch(
        &self,
        changes: &[FileChange],
        collection: &str,
        cancel: &CancellationToken,
    ) -> Result<(Applied, usize)> {
        let settings = ProcessingMode::Batch.settings(&self.config);
        let indexer = self.indexer(&settings);
        let applied = self
            .process_in_batches(&indexer, changes, collection, &settings, "Processing", cancel)
            .await?;

        let dependents: Vec<String> = self.dependents_of(changes).await.into_iter().collect();
        if !dependents.is_empty() {
            info!(dependents = dependents.len(), "Invalidating dependent files");
            self.ctx.file_cache.invalidate(&dependents);
            self.ctx.search_cache.invalidate_collection(collection);
        }
        Ok((applied, dependents.len()))
    }

    async fn process_bulk(
        &self,
        changes: &[FileChange],
        collection: &str,
        cancel: &CancellationToken,
    ) -> Result<(Applied, usize)> {
        info!("Entering bulk mode, clearing search cache");
        self.ctx.search_cache.clear();

        let settings = ProcessingMode::Bulk.settings(&self.config);
        let indexer = self.indexer(&settings).without_dependency_updates();
        let result = self
            .process_in_batches(&indexer, changes, collection, &settings, "Bulk", cancel)
            .await;

        // The graph is stale after a partial run too.
        rebuild_dependencies(&self.ctx, collection).await;
        Ok((result?, 0))
    }

    async fn process_offline(
        &self,
        changes: &[FileChange],
        collection: &str,
        cancel: &CancellationToken,
    ) -> Result<(Applied, usize)> {
        let temp = format!("{}_temp_{}", collection, Utc::now().timestamp());
        warn!(collection, temp = %temp, "Entering offline mode, rebuilding into temporary collection");

        let settings = ProcessingMode::Offline.settings(&self.config);
        let indexer = self.indexer(&settings).without_dependency_updates();

        // Deletions are applied by leaving files out of the rebuild.
        let plan = ChangePlan::new(changes);
        let removed: HashSet<&Path> = plan
            .deletes
            .iter()
            .chain(&plan.renamed_from)
            .map(PathBuf::as_path)
            .collect();
        let changed: HashSet<&Path> = plan.indexes.iter().map(PathBuf::as_path).collect();
        let carried: Vec<FileChange> = self
            .ctx
            .manifest
            .read()
            .await
            .files(collection)
            .into_iter()
            .map(PathBuf::from)
            .filter(|p| !removed.contains(p.as_path()) && !changed.contains(p.as_path()))
            .map(|p| FileChange::new(p, ChangeType::Modify))
            .collect();
        let rebuild: Vec<FileChange> = plan
            .indexes
            .iter()
            .map(|p| FileChange::new(p.clone(), ChangeType::Create))
            .collect();

        let result = async {
            let mut applied = self
                .process_in_batches(&indexer, &rebuild, &temp, &settings, "Offline", cancel)
                .await?;
            applied.processed += plan.deletes.len();
            let carried_over = self
                .process_in_batches(&indexer, &carried, &temp, &settings, "Offline carry-over", cancel)
                .await?;
            if carried_over.failed > 0 {
                warn!(failed = carried_over.failed, "Some unchanged files failed to re-index");
            }
            Ok::<_, anyhow::Error>(applied)
        }
        .await;

        let applied = match result {
            Ok(applied) => applied,
            Err(e) => {
                self.discard_collection(&temp).await;
                return Err(e);
            }
        };

        self.complete_swap(collection, &temp).await?;
        Ok((applied, 0))
    }

    /// Publish the staged collection `temp` as `live` in the vector store,
    /// the keyword index and the manifest, then rebuild the dependency
    /// graph.
    ///
    /// A failed store swap returns [`RefactorError::SwapFailed`]. While
    /// `live` is still intact `temp` is discarded. Once `live` is gone the
    /// rebuilt data exists only in `temp`, so it is kept and the swap can
    /// be retried with the name from the error.
    pub async fn complete_swap(&self, live: &str, temp: &str) -> Result<()> {
        info!(live, temp, "Swapping collections");
        let swapped = match self
            .ctx
            .store
            .create_collection(temp, self.ctx.embedder.dimensions())
            .await
        {
            Ok(()) => self.ctx.store.swap_collection(live, temp).await,
            Err(e) => Err(e),
        };
        if let Err(e) = swapped {
            let live_intact = match self.ctx.store.list_collections().await {
                Ok(names) => names.iter().any(|n| n == live),
                Err(_) => false,
            };
            if live_intact {
                warn!(live, temp, error = %e, "Swap failed, live collection untouched");
                self.discard_collection(temp).await;
            } else {
                warn!(live, temp, error = %e, "Swap failed after live collection was removed, keeping temporary collection");
            }
            return Err(RefactorError::SwapFailed {
                live: live.to_string(),
                temp: temp.to_string(),
                reason: e.to_string(),
            }
            .into());
        }
        if let Err(e) = self.ctx.keyword.swap_collection(live, temp) {
            // Nothing was staged: the rebuilt collection has no documents.
            debug!(live, error = %e, "No keyword documents staged");
            if let Err(e) = self.ctx.keyword.delete_collection(live) {
                warn!(live, error = %e, "Failed to clear keyword collection");
            }
        }
        self.ctx.manifest.write().await.swap_collection(live, temp);
        self.ctx.search_cache.invalidate_collection(live);

        rebuild_dependencies(&self.ctx, live).await;
        Ok(())
    }

    async fn discard_collection(&self, temp: &str) {
        info!(temp, "Cleaning up temporary collection");
        if let Err(e) = self.ctx.store.delete_collection(temp).await {
            warn!(temp, error = %e, "Failed to delete temporary collection");
        }
        if let Err(e) = self.ctx.keyword.delete_collection(temp) {
            debug!(temp, error = %e, "No temporary keyword collection to delete");
        }
        self.ctx.manifest.write().await.clear_collection(temp);
    }
}
