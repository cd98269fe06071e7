//! Opus Mirror Engine
//!
//! Keeps a mirror of a music library in sync across repeated runs:
//! - Audio files are transcoded to Opus through an external encoder
//! - Everything else is copied verbatim, cloud-sync placeholders are skipped
//! - A persisted size/mtime store avoids redundant work
//! - Target entries whose source disappeared can be reconciled away
//! - Directory structures can be diffed to verify a mirror

pub mod action;
pub mod metadata;
pub mod exclusion;
pub mod detector;
pub mod pool;
pub mod reconcile;
pub mod engine;
pub mod report;
pub mod structure;
pub mod error;

// Re-export main types and functions
pub use action::{Action, TARGET_EXTENSION, TRANSCODE_EXTENSIONS, IGNORED_EXTENSIONS};
pub use metadata::{FileStamp, MetadataStore, relative_key, store_key};
pub use exclusion::ExclusionSet;
pub use detector::{ChangeDetector, Verdict};
pub use pool::{fallback_destination, Encoder, PendingTask, TaskOutcome, TaskReport, WorkerPool};
pub use reconcile::{DeletionReconciler, ReconcileSummary};
pub use engine::{MigrationEngine, MigrationOptions};
pub use report::MigrationReport;
pub use structure::{diff_dirs, structure, unified_diff};
pub use error::{MirrorError, Result};

/// Load the configured store, run one migration and return its report
pub async fn migrate(options: MigrationOptions) -> Result<MigrationReport> {
    let mut engine = MigrationEngine::from_options(options).await?;
    engine.run().await
}
