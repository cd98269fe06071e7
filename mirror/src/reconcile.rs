//! Deletion reconciliation: drop target entries whose source is gone

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::action::{extension_of, TARGET_EXTENSION, TRANSCODE_EXTENSIONS};
use crate::error::{MirrorError, Result};
use crate::exclusion::ExclusionSet;
use crate::metadata::{relative_key, MetadataStore};

/// What a reconciliation pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub deleted_files: usize,
    pub deleted_dirs: usize,
    pub pruned_entries: usize,
}

/// Removes orphaned target files, then the directories they leave empty
#[derive(Debug, Clone)]
pub struct DeletionReconciler {
    source_root: PathBuf,
    target_root: PathBuf,
    exclusions: ExclusionSet,
}

impl DeletionReconciler {
    pub fn new(source_root: impl Into<PathBuf>, target_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            target_root: target_root.into(),
            exclusions: ExclusionSet::default(),
        }
    }

    /// Leave target files whose base name matches `exclusions` untouched
    pub fn with_exclusions(mut self, exclusions: ExclusionSet) -> Self {
        self.exclusions = exclusions;
        self
    }

    /// Run both passes. File deletions finish before any directory is looked at.
    pub async fn run(&self, mut store: Option<&mut MetadataStore>) -> Result<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();

        if !self.target_root.is_dir() {
            return Ok(summary);
        }

        info!("checking source files that do not exist anymore");

        for target_file in self.target_files() {
            if self.exclusions.is_excluded(&target_file) {
                debug!(path = %target_file.display(), "excluded, keeping");
                continue;
            }

            let relative = target_file
                .strip_prefix(&self.target_root)
                .map_err(|e| MirrorError::path_error(&target_file, format!("Failed to create relative path: {}", e)))?
                .to_path_buf();

            if self.source_exists_for(&relative) {
                continue;
            }

            info!(path = %target_file.display(), "deleting (source file doesn't exist anymore)");
            if let Err(e) = fs::remove_file(&target_file).await {
                error!("{}", MirrorError::deletion_error(&target_file, e.to_string()));
                continue;
            }
            summary.deleted_files += 1;

            if let Some(store) = store.as_deref_mut() {
                summary.pruned_entries += prune(store, &relative);
            }
        }

        summary.deleted_dirs = self.remove_empty_dirs().await;
        Ok(summary)
    }

    /// Every regular file below the target root
    fn target_files(&self) -> Vec<PathBuf> {
        WalkDir::new(&self.target_root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("{}", MirrorError::walk_error(&self.target_root, e.to_string()));
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect()
    }

    /// Whether the target file at `relative` still has a source counterpart.
    ///
    /// A transcoded file survives if any transcodable variant of its base
    /// name exists; anything else needs the exact same relative path.
    pub fn source_exists_for(&self, relative: &Path) -> bool {
        let source = self.source_root.join(relative);
        if extension_of(relative) == Some(TARGET_EXTENSION) {
            TRANSCODE_EXTENSIONS
                .iter()
                .any(|ext| source.with_extension(ext).is_file())
        } else {
            source.is_file()
        }
    }

    /// Remove directories left empty, deepest first, never the root itself
    async fn remove_empty_dirs(&self) -> usize {
        let dirs: Vec<PathBuf> = WalkDir::new(&self.target_root)
            .min_depth(1)
            .contents_first(true)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_dir())
            .map(|entry| entry.into_path())
            .collect();

        let mut removed = 0;
        for dir in dirs {
            if !is_empty_dir(&dir).await {
                continue;
            }
            info!(path = %dir.display(), "deleting (empty directory)");
            match fs::remove_dir(&dir).await {
                Ok(()) => removed += 1,
                Err(e) => error!("{}", MirrorError::deletion_error(&dir, e.to_string())),
            }
        }
        removed
    }
}

async fn is_empty_dir(dir: &Path) -> bool {
    match fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => false,
    }
}

/// Drop the store entries that produced the deleted target file.
///
/// Keys are source-relative paths: every transcodable variant for a
/// transcoded file, the exact path otherwise.
fn prune(store: &mut MetadataStore, relative: &Path) -> usize {
    if extension_of(relative) == Some(TARGET_EXTENSION) {
        TRANSCODE_EXTENSIONS
            .iter()
            .filter(|ext| store.remove(&relative_key(&relative.with_extension(ext))).is_some())
            .count()
    } else {
        usize::from(store.remove(&relative_key(relative)).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::FileStamp;
    use tempfile::TempDir;

    fn stamp() -> FileStamp {
        FileStamp { size: 1, last_modified: 1.0 }
    }

    async fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        fs::write(path, b"x").await.unwrap();
    }

    #[tokio::test]
    async fn test_deletes_orphans_and_keeps_live_files() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("source");
        let target = temp_dir.path().join("target");

        touch(&source.join("a.wav")).await;
        touch(&source.join("cover.png")).await;
        touch(&target.join("a.opus")).await;
        touch(&target.join("b.opus")).await;
        touch(&target.join("cover.png")).await;
        touch(&target.join("old.png")).await;

        let mut store = MetadataStore::new(temp_dir.path().join("db.json"));
        store.record("a.wav", stamp());
        store.record("b.flac", stamp());
        store.record("old.png", stamp());

        let summary = DeletionReconciler::new(&source, &target)
            .run(Some(&mut store))
            .await
            .unwrap();

        assert_eq!(summary.deleted_files, 2);
        assert_eq!(summary.pruned_entries, 2);
        assert!(target.join("a.opus").exists());
        assert!(target.join("cover.png").exists());
        assert!(!target.join("b.opus").exists());
        assert!(!target.join("old.png").exists());
        assert!(store.get("a.wav").is_some());
        assert!(store.get("b.flac").is_none());
        assert!(store.get("old.png").is_none());
    }

    #[tokio::test]
    async fn test_excluded_target_files_are_kept() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("source");
        let target = temp_dir.path().join("target");

        fs::create_dir_all(&source).await.unwrap();
        touch(&target.join("art").join("folder.jpg")).await;
        touch(&target.join("orphan.opus")).await;

        let mut store = MetadataStore::new(temp_dir.path().join("db.json"));
        store.record("art/folder.jpg", stamp());

        let exclusions = ExclusionSet::new(&["folder.jpg"]).unwrap();
        let summary = DeletionReconciler::new(&source, &target)
            .with_exclusions(exclusions)
            .run(Some(&mut store))
            .await
            .unwrap();

        assert_eq!(summary.deleted_files, 1);
        assert_eq!(summary.pruned_entries, 0);
        assert!(target.join("art").join("folder.jpg").exists());
        assert!(!target.join("orphan.opus").exists());
        assert!(store.get("art/folder.jpg").is_some());
    }

    #[tokio::test]
    async fn test_copy_mode_needs_identical_extension() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("source");
        let target = temp_dir.path().join("target");

        touch(&source.join("notes.txt")).await;
        touch(&target.join("notes.md")).await;

        let summary = DeletionReconciler::new(&source, &target).run(None).await.unwrap();
        assert_eq!(summary.deleted_files, 1);
        assert!(!target.join("notes.md").exists());
    }

    #[tokio::test]
    async fn test_fallback_copies_survive() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("source");
        let target = temp_dir.path().join("target");

        touch(&source.join("vorbis.ogg")).await;
        touch(&target.join("vorbis.ogg")).await;

        let summary = DeletionReconciler::new(&source, &target).run(None).await.unwrap();
        assert_eq!(summary.deleted_files, 0);
        assert!(target.join("vorbis.ogg").exists());
    }

    #[tokio::test]
    async fn test_removes_nested_empty_directories() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("source");
        let target = temp_dir.path().join("target");

        fs::create_dir_all(&source).await.unwrap();
        touch(&target.join("gone").join("deeper").join("x.opus")).await;
        fs::create_dir_all(target.join("already").join("empty")).await.unwrap();
        touch(&target.join("kept").join("y.png")).await;
        touch(&source.join("kept").join("y.png")).await;

        let summary = DeletionReconciler::new(&source, &target).run(None).await.unwrap();

        assert_eq!(summary.deleted_files, 1);
        assert_eq!(summary.deleted_dirs, 4);
        assert!(target.is_dir());
        assert!(target.join("kept").join("y.png").exists());
        let empties: Vec<_> = WalkDir::new(&target)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
            .filter(|e| std::fs::read_dir(e.path()).unwrap().next().is_none())
            .collect();
        assert!(empties.is_empty());
    }

    #[tokio::test]
    async fn test_missing_target_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let summary = DeletionReconciler::new(temp_dir.path(), temp_dir.path().join("nope"))
            .run(None)
            .await
            .unwrap();
        assert_eq!(summary, ReconcileSummary::default());
    }
}
