//! Extension to action mapping

use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};

/// Extension written for transcoded files
pub const TARGET_EXTENSION: &str = "opus";

/// Source extensions handed to the encoder
pub const TRANSCODE_EXTENSIONS: &[&str] = &["wav", "flac", "ogg", "aif", "aiff", "aifc"];

/// Cloud-sync placeholder files that are never mirrored
pub const IGNORED_EXTENSIONS: &[&str] = &["driveupload", "drivedownload"];

/// What happens to a single source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    /// Encode into the target codec
    Transcode,
    /// Copy byte for byte, keeping the extension
    Copy,
    /// Write nothing, record nothing
    Ignore,
}

impl Action {
    /// Pick the action for a file extension (without the leading dot).
    ///
    /// Matching is exact and case-sensitive; anything unknown is copied.
    pub fn classify(extension: Option<&str>) -> Self {
        match extension {
            Some(ext) if TRANSCODE_EXTENSIONS.contains(&ext) => Action::Transcode,
            Some(ext) if IGNORED_EXTENSIONS.contains(&ext) => Action::Ignore,
            _ => Action::Copy,
        }
    }

    /// Classify a path by its extension
    pub fn for_path(path: &Path) -> Self {
        Self::classify(extension_of(path))
    }

    /// Destination for a source path relative to the source root, re-rooted
    /// under `target_root`. `None` for ignored files.
    pub fn destination(&self, target_root: &Path, relative: &Path) -> Option<PathBuf> {
        match self {
            Action::Transcode => Some(target_root.join(relative).with_extension(TARGET_EXTENSION)),
            Action::Copy => Some(target_root.join(relative)),
            Action::Ignore => None,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Transcode => write!(f, "Transcode"),
            Action::Copy => write!(f, "Copy"),
            Action::Ignore => write!(f, "Ignore"),
        }
    }
}

pub fn extension_of(path: &Path) -> Option<&str> {
    path.extension().and_then(|ext| ext.to_str())
}
