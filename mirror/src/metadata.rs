//! Persisted size/mtime index used to skip files that have not changed

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::error::{MirrorError, Result};

/// Size and modification time of a source file at the time it was last seen
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FileStamp {
    /// File size in bytes
    pub size: u64,
    /// Modification time in seconds since the Unix epoch
    pub last_modified: f64,
}

impl FileStamp {
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Result<Self> {
        let modified = metadata.modified()?;
        Ok(Self {
            size: metadata.len(),
            last_modified: epoch_seconds(modified),
        })
    }

    /// Read the current stamp of a file on disk
    pub async fn of(path: &Path) -> Result<Self> {
        let metadata = fs::metadata(path).await.map_err(|e| {
            MirrorError::path_error(path, format!("Failed to read metadata: {}", e))
        })?;
        Self::from_metadata(&metadata)
    }
}

fn epoch_seconds(time: SystemTime) -> f64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs_f64(),
        Err(before) => -before.duration().as_secs_f64(),
    }
}

/// Store key for a path relative to the source root.
///
/// Components are joined with `/` on every platform so a store written on
/// one system stays valid on another.
pub fn relative_key(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Store key for a source-relative path, or `None` when the path is not
/// valid UTF-8 and would collide with other names after lossy conversion.
pub fn store_key(relative: &Path) -> Option<String> {
    relative.to_str().map(|_| relative_key(relative))
}

/// Mapping from source-relative path to the last stamp seen for it.
///
/// The whole store is rewritten on every flush; there is no append format.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    path: PathBuf,
    entries: BTreeMap<String, FileStamp>,
}

impl MetadataStore {
    /// Create an empty store that will be written to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Load the store from `path`.
    ///
    /// A missing file yields an empty store. A file that exists but cannot be
    /// parsed is an error: prior state is never silently discarded.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no metadata store yet, starting empty");
                return Ok(Self::new(path));
            }
            Err(e) => return Err(MirrorError::metadata_load(&path, e.to_string())),
        };

        let entries: BTreeMap<String, FileStamp> = serde_json::from_str(&content)
            .map_err(|e| MirrorError::metadata_load(&path, e.to_string()))?;

        debug!(path = %path.display(), entries = entries.len(), "loaded metadata store");
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&FileStamp> {
        self.entries.get(key)
    }

    pub fn record(&mut self, key: impl Into<String>, stamp: FileStamp) {
        self.entries.insert(key.into(), stamp);
    }

    pub fn remove(&mut self, key: &str) -> Option<FileStamp> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize the whole store to its file.
    ///
    /// Writes to a sibling temp file first and renames it into place, so an
    /// interrupted flush leaves the previous document intact.
    pub async fn flush(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    MirrorError::metadata_save(&self.path, format!("Failed to create parent directory: {}", e))
                })?;
            }
        }

        let content = serde_json::to_string(&self.entries)?;

        let mut tmp_name = OsString::from(self.path.as_os_str());
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        fs::write(&tmp_path, content).await.map_err(|e| {
            MirrorError::metadata_save(&self.path, e.to_string())
        })?;
        fs::rename(&tmp_path, &self.path).await.map_err(|e| {
            MirrorError::metadata_save(&self.path, e.to_string())
        })?;

        debug!(path = %self.path.display(), entries = self.entries.len(), "flushed metadata store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_relative_key_uses_forward_slashes() {
        let rel = Path::new("nested").join("deep").join("wave.wav");
        assert_eq!(relative_key(&rel), "nested/deep/wave.wav");
        assert_eq!(relative_key(Path::new("./a.flac")), "a.flac");
    }

    #[cfg(unix)]
    #[test]
    fn test_store_key_rejects_non_utf8() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        assert_eq!(store_key(Path::new("nested/a.wav")), Some("nested/a.wav".to_string()));
        let first = Path::new(OsStr::from_bytes(b"bad\xff.png"));
        let second = Path::new(OsStr::from_bytes(b"bad\xfe.png"));
        assert_eq!(relative_key(first), relative_key(second));
        assert_eq!(store_key(first), None);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = MetadataStore::load(temp_dir.path().join("db.json")).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_load_corrupt_file_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("db.json");
        fs::write(&path, b"{ not json").await.unwrap();

        let err = MetadataStore::load(&path).await.unwrap_err();
        assert!(matches!(err, MirrorError::MetadataLoad { .. }));
    }

    #[tokio::test]
    async fn test_flush_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state").join("db.json");

        let mut store = MetadataStore::new(&path);
        store.record("a.wav", FileStamp { size: 94182, last_modified: 1_600_000_000.25 });
        store.record("nested/b.flac", FileStamp { size: 1, last_modified: 123.0 });
        store.flush().await.unwrap();

        let reloaded = MetadataStore::load(&path).await.unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(
            reloaded.get("a.wav"),
            Some(&FileStamp { size: 94182, last_modified: 1_600_000_000.25 })
        );
        assert!(!path.with_file_name("db.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_reads_document_layout() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("db.json");
        fs::write(&path, br#"{"wave.wav": {"size": 94182, "last_modified": 1577836800.5}}"#)
            .await
            .unwrap();

        let store = MetadataStore::load(&path).await.unwrap();
        let stamp = store.get("wave.wav").unwrap();
        assert_eq!(stamp.size, 94182);
        assert_eq!(stamp.last_modified, 1577836800.5);
    }

    #[tokio::test]
    async fn test_stamp_of_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.txt");
        fs::write(&path, b"hello").await.unwrap();

        let stamp = FileStamp::of(&path).await.unwrap();
        assert_eq!(stamp.size, 5);
        assert!(stamp.last_modified > 0.0);
        assert_eq!(stamp, FileStamp::of(&path).await.unwrap());
    }
}
