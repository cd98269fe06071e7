//! Migration engine that walks the source tree and keeps the target in sync

use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::action::Action;
use crate::detector::{ChangeDetector, Verdict};
use crate::error::{MirrorError, Result};
use crate::exclusion::ExclusionSet;
use crate::metadata::{relative_key, store_key, MetadataStore};
use crate::pool::{fallback_destination, Encoder, PendingTask, TaskReport, WorkerPool};
use crate::reconcile::DeletionReconciler;
use crate::report::MigrationReport;

/// Options for a migration run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationOptions {
    /// Root of the tree to mirror
    pub source: PathBuf,
    /// Root of the mirror
    pub target: PathBuf,
    /// Number of concurrent workers
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Delete target files whose source no longer exists
    #[serde(default)]
    pub delete_removed: bool,
    /// Encoder program, looked up on PATH unless it is a path
    #[serde(default = "default_encoder")]
    pub encoder: String,
    /// Extra arguments appended to every encoder invocation
    #[serde(default)]
    pub encoder_args: Vec<String>,
    /// Metadata store file; no store when unset
    #[serde(default)]
    pub database: Option<PathBuf>,
    /// Glob patterns matched against destination base names
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Flush the metadata store every this many visited files (0 = only at the end)
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,
    /// Wait for each task right after submitting it
    #[serde(default)]
    pub wait_per_task: bool,
    /// Upper bound on a single per-task wait, in seconds
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            source: PathBuf::new(),
            target: PathBuf::new(),
            threads: default_threads(),
            delete_removed: false,
            encoder: default_encoder(),
            encoder_args: Vec::new(),
            database: None,
            exclude: Vec::new(),
            checkpoint_every: default_checkpoint_every(),
            wait_per_task: false,
            task_timeout_secs: default_task_timeout_secs(),
        }
    }
}

pub fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

pub fn default_encoder() -> String { "opusenc".to_string() }
pub fn default_checkpoint_every() -> usize { 100 }
pub fn default_task_timeout_secs() -> u64 { 600 }

/// Incremental migration engine
pub struct MigrationEngine {
    options: MigrationOptions,
    detector: ChangeDetector,
    store: Option<MetadataStore>,
}

impl MigrationEngine {
    /// Create an engine with an already loaded store (or none)
    pub fn new(options: MigrationOptions, store: Option<MetadataStore>) -> Result<Self> {
        let exclusions = ExclusionSet::new(&options.exclude)?;
        Ok(Self {
            options,
            detector: ChangeDetector::new(exclusions),
            store,
        })
    }

    /// Create an engine, loading the store named by `options.database`
    pub async fn from_options(options: MigrationOptions) -> Result<Self> {
        let store = match &options.database {
            Some(path) => Some(MetadataStore::load(path).await?),
            None => None,
        };
        Self::new(options, store)
    }

    pub fn options(&self) -> &MigrationOptions {
        &self.options
    }

    pub fn store(&self) -> Option<&MetadataStore> {
        self.store.as_ref()
    }

    pub fn into_store(self) -> Option<MetadataStore> {
        self.store
    }

    /// Whether `destination` has to be rebuilt from `source`.
    ///
    /// `relative` is the source path relative to the source root.
    pub async fn needs_migration(&self, source: &Path, destination: &Path, relative: &Path) -> Result<bool> {
        let key = relative_key(relative);
        let verdict = self
            .assess(self.store.as_ref(), Action::for_path(relative), source, destination, &key)
            .await?;
        Ok(verdict.needs_migration())
    }

    /// Assess a pair, treating an intact fallback copy of a refused
    /// transcode as the destination when the encoded file is absent
    async fn assess(
        &self,
        store: Option<&MetadataStore>,
        action: Action,
        source: &Path,
        destination: &Path,
        key: &str,
    ) -> Result<Verdict> {
        let verdict = self.detector.assess(store, source, destination, key).await?;
        if action != Action::Transcode || !matches!(verdict, Verdict::Missing(_)) {
            return Ok(verdict);
        }

        let fallback = fallback_destination(destination, source);
        if fallback == destination || !fs::metadata(&fallback).await.map(|m| m.is_file()).unwrap_or(false) {
            return Ok(verdict);
        }
        self.detector.assess(store, source, &fallback, key).await
    }

    /// Run one full migration: reconcile, walk, drain, flush
    pub async fn run(&mut self) -> Result<MigrationReport> {
        let mut report = MigrationReport::new();
        report.start();

        let encoder = Encoder::new(&self.options.encoder, self.options.encoder_args.clone());
        encoder.probe().await?;
        debug!(encoder = encoder.program(), args = ?encoder.args(), "encoder available");

        let source_root = self.options.source.clone();
        if !source_root.is_dir() {
            return Err(MirrorError::path_error(&source_root, "Source directory does not exist"));
        }

        if self.options.delete_removed {
            let summary = DeletionReconciler::new(&source_root, &self.options.target)
                .with_exclusions(self.detector.exclusions().clone())
                .run(self.store.as_mut())
                .await?;
            report.deleted_files = summary.deleted_files;
            report.deleted_dirs = summary.deleted_dirs;
            report.pruned_entries = summary.pruned_entries;
        }

        let mut pool = WorkerPool::new(self.options.threads, encoder);
        if self.options.wait_per_task {
            pool = pool.with_wait_per_task(Duration::from_secs(self.options.task_timeout_secs));
        }

        let exclusions = self.detector.exclusions();
        if !exclusions.is_empty() {
            info!(patterns = ?exclusions.patterns(), "excluding destinations");
        }

        info!(source = %source_root.display(), workers = pool.width(), "checking for unconverted files");
        for entry in WalkDir::new(&source_root).min_depth(1).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("{}", MirrorError::walk_error(&source_root, e.to_string()));
                    report.failed += 1;
                    continue;
                }
            };
            if !is_source_file(&entry) {
                continue;
            }

            report.visited += 1;
            let finished = self.visit(entry.path(), &mut pool, &mut report).await;
            self.absorb(finished, &mut report);

            let every = self.options.checkpoint_every;
            if every > 0 && report.visited % every == 0 {
                self.checkpoint().await;
            }
        }

        info!(in_flight = pool.in_flight(), "finishing conversions");
        let finished = pool.drain().await;
        self.absorb(finished, &mut report);

        if let Some(store) = &self.store {
            info!(path = %store.path().display(), entries = store.len(), "updating db file");
            store.flush().await?;
        }

        report.complete();
        Ok(report)
    }

    /// Assess one source file and submit work for it if needed
    async fn visit(
        &mut self,
        source: &Path,
        pool: &mut WorkerPool,
        report: &mut MigrationReport,
    ) -> Vec<Result<TaskReport>> {
        let relative = match source.strip_prefix(&self.options.source) {
            Ok(relative) => relative.to_path_buf(),
            Err(e) => {
                error!("{}", MirrorError::path_error(source, format!("Failed to create relative path: {}", e)));
                report.failed += 1;
                return Vec::new();
            }
        };

        let action = Action::for_path(&relative);
        let Some(destination) = action.destination(&self.options.target, &relative) else {
            debug!(path = %source.display(), "ignoring");
            report.ignored += 1;
            return Vec::new();
        };

        let key = store_key(&relative);
        if key.is_none() {
            warn!(path = %source.display(), "path is not valid UTF-8, not tracking it in the metadata store");
        }
        let store = key.as_ref().and(self.store.as_ref());
        let verdict = match self
            .assess(store, action, source, &destination, key.as_deref().unwrap_or_default())
            .await
        {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(path = %source.display(), "cannot assess file: {}", e);
                report.failed += 1;
                return Vec::new();
            }
        };

        let stamp = match verdict.stamp() {
            None => {
                debug!(destination = %destination.display(), "excluded");
                report.excluded += 1;
                return Vec::new();
            }
            Some(stamp) if !verdict.needs_migration() => {
                debug!(path = %source.display(), reason = verdict.reason(), "up to date");
                report.up_to_date += 1;
                if let (Some(store), Some(key)) = (self.store.as_mut(), key) {
                    store.record(key, stamp);
                }
                return Vec::new();
            }
            Some(stamp) => stamp,
        };

        if let Some(parent) = destination.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                error!("{}", MirrorError::path_error(parent, format!("Failed to create directory: {}", e)));
                report.failed += 1;
                return Vec::new();
            }
        }

        info!(
            source = %source.display(),
            destination = %destination.display(),
            action = %action,
            reason = verdict.reason(),
            "migrating"
        );
        pool.submit(PendingTask {
            source: source.to_path_buf(),
            destination,
            action,
            key,
            stamp,
        })
        .await
    }

    /// Fold finished tasks into the report and the store
    fn absorb(&mut self, finished: Vec<Result<TaskReport>>, report: &mut MigrationReport) {
        for joined in finished {
            let done = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!("{}", e);
                    report.failed += 1;
                    continue;
                }
            };

            match done.result {
                Ok(outcome) => {
                    report.record_outcome(&outcome);
                    if let (Some(store), Some(key)) = (self.store.as_mut(), done.task.key) {
                        store.record(key, done.task.stamp);
                    }
                }
                Err(e) => {
                    error!(source = %done.task.source.display(), "{}", e);
                    report.failed += 1;
                }
            }
        }
    }

    /// Periodic flush; a failure here is logged and the run goes on
    async fn checkpoint(&self) {
        if let Some(store) = &self.store {
            match store.flush().await {
                Ok(()) => debug!(entries = store.len(), "checkpointed metadata store"),
                Err(e) => warn!("metadata checkpoint failed: {}", e),
            }
        }
    }
}

/// Regular files, and symlinks that resolve to one. Links to directories
/// are not descended into.
fn is_source_file(entry: &walkdir::DirEntry) -> bool {
    if entry.path_is_symlink() {
        let resolves = entry.path().is_file();
        if !resolves {
            debug!(path = %entry.path().display(), "skipping symlink that is not a file");
        }
        resolves
    } else {
        entry.file_type().is_file()
    }
}
