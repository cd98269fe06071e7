//! Statistics for a single migration run

use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::pool::TaskOutcome;

/// Counters collected while a run walks, dispatches and reconciles
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Source files visited by the walker
    pub visited: usize,
    /// Files encoded into the target codec
    pub transcoded: usize,
    /// Files copied verbatim
    pub copied: usize,
    /// Transcodes that fell back to a raw copy
    pub fallback_copies: usize,
    /// Files whose destination was already up to date
    pub up_to_date: usize,
    /// Files skipped because of their extension
    pub ignored: usize,
    /// Files skipped because of an exclusion pattern
    pub excluded: usize,
    /// Files that could not be assessed or migrated
    pub failed: usize,
    /// Orphaned target files removed
    pub deleted_files: usize,
    /// Empty target directories removed
    pub deleted_dirs: usize,
    /// Metadata store entries pruned along with deleted files
    pub pruned_entries: usize,
    /// Wall-clock duration of the run
    pub duration: Duration,
    #[serde(skip)]
    started: Option<Instant>,
}

impl MigrationReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the run as started
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    pub fn record_outcome(&mut self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Transcoded => self.transcoded += 1,
            TaskOutcome::Copied => self.copied += 1,
            TaskOutcome::FallbackCopied(_) => self.fallback_copies += 1,
            TaskOutcome::Ignored => self.ignored += 1,
        }
    }

    /// Files written during this run
    pub fn migrated(&self) -> usize {
        self.transcoded + self.copied + self.fallback_copies
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }

    /// Mark the run as completed and log a summary
    pub fn complete(&mut self) {
        if let Some(started) = self.started {
            self.duration = started.elapsed();
        }

        info!(
            duration_secs = self.duration.as_secs_f64(),
            visited = self.visited,
            transcoded = self.transcoded,
            copied = self.copied,
            fallback_copies = self.fallback_copies,
            up_to_date = self.up_to_date,
            ignored = self.ignored,
            excluded = self.excluded,
            failed = self.failed,
            deleted_files = self.deleted_files,
            deleted_dirs = self.deleted_dirs,
            "Migration completed"
        );
    }
}
