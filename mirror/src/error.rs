//! Error types for the migration engine

use std::path::PathBuf;

/// Result type alias for migration operations
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Error type for everything the migration engine can fail on
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Path-related errors
    #[error("Path error at '{path}': {message}")]
    Path { path: PathBuf, message: String },

    /// The metadata store file exists but could not be read or parsed
    #[error("Failed to load metadata store '{path}': {message}")]
    MetadataLoad { path: PathBuf, message: String },

    /// The metadata store could not be written back
    #[error("Failed to save metadata store '{path}': {message}")]
    MetadataSave { path: PathBuf, message: String },

    /// Exclusion pattern errors
    #[error("Exclusion pattern error: {0}")]
    Pattern(String),

    /// The configured encoder binary cannot be started at all
    #[error("Encoder '{program}' not found: {message}")]
    EncoderMissing { program: String, message: String },

    /// The encoder could not be spawned for a single task
    #[error("Failed to run encoder on '{path}': {message}")]
    EncoderSpawn { path: PathBuf, message: String },

    /// File comparison errors
    #[error("Comparison error: {message}")]
    Comparison { message: String },

    /// File copying errors
    #[error("File copy error: {message}")]
    FileCopy { message: String },

    /// File deletion errors
    #[error("File deletion error at '{path}': {message}")]
    FileDeletion { path: PathBuf, message: String },

    /// Directory traversal errors
    #[error("Directory walk error at '{path}': {message}")]
    Walk { path: PathBuf, message: String },

    /// A worker task panicked or was aborted
    #[error("Worker task failed: {0}")]
    Task(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MirrorError {
    /// Create a new path error
    pub fn path_error(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Path {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn metadata_load(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::MetadataLoad {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn metadata_save(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::MetadataSave {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new comparison error
    pub fn comparison_error(
        source: impl AsRef<std::path::Path>,
        dest: impl AsRef<std::path::Path>,
        message: impl Into<String>,
    ) -> Self {
        let full_message = format!(
            "Comparison error between '{}' and '{}': {}",
            source.as_ref().display(),
            dest.as_ref().display(),
            message.into()
        );
        Self::Comparison {
            message: full_message,
        }
    }

    /// Create a new file copy error
    pub fn copy_error(
        source: impl AsRef<std::path::Path>,
        dest: impl AsRef<std::path::Path>,
        message: impl Into<String>,
    ) -> Self {
        let full_message = format!(
            "File copy error from '{}' to '{}': {}",
            source.as_ref().display(),
            dest.as_ref().display(),
            message.into()
        );
        Self::FileCopy {
            message: full_message,
        }
    }

    /// Create a new file deletion error
    pub fn deletion_error(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::FileDeletion {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn walk_error(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Walk {
            path: path.into(),
            message: message.into(),
        }
    }
}
