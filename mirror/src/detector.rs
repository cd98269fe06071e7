//! Change detection: decides whether a source/destination pair needs work

use std::path::Path;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

use crate::error::{MirrorError, Result};
use crate::exclusion::ExclusionSet;
use crate::metadata::{FileStamp, MetadataStore};

/// Outcome of assessing one source/destination pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// Destination base name matches an exclusion pattern
    Excluded,
    /// Destination does not exist yet
    Missing(FileStamp),
    /// Destination bytes equal the source bytes
    Identical(FileStamp),
    /// Stored size and mtime match the source
    Fresh(FileStamp),
    /// Stored size or mtime differ from the source
    Stale(FileStamp),
    /// Store is active but has no entry for the file
    Untracked(FileStamp),
    /// No store, destination exists but differs from the source
    Differs(FileStamp),
}

impl Verdict {
    pub fn needs_migration(&self) -> bool {
        matches!(
            self,
            Verdict::Missing(_) | Verdict::Stale(_) | Verdict::Untracked(_) | Verdict::Differs(_)
        )
    }

    /// Current source stamp, unless the pair was excluded before it was read
    pub fn stamp(&self) -> Option<FileStamp> {
        match self {
            Verdict::Excluded => None,
            Verdict::Missing(stamp)
            | Verdict::Identical(stamp)
            | Verdict::Fresh(stamp)
            | Verdict::Stale(stamp)
            | Verdict::Untracked(stamp)
            | Verdict::Differs(stamp) => Some(*stamp),
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Verdict::Excluded => "excluded",
            Verdict::Missing(_) => "destination missing",
            Verdict::Identical(_) => "content identical",
            Verdict::Fresh(_) => "unchanged since last run",
            Verdict::Stale(_) => "source changed",
            Verdict::Untracked(_) => "not in metadata store",
            Verdict::Differs(_) => "content differs",
        }
    }
}

/// Change detector combining exclusion, existence, content and metadata checks
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    exclusions: ExclusionSet,
    buffer_size: usize,
}

impl ChangeDetector {
    pub fn new(exclusions: ExclusionSet) -> Self {
        Self {
            exclusions,
            buffer_size: 64 * 1024,
        }
    }

    pub fn exclusions(&self) -> &ExclusionSet {
        &self.exclusions
    }

    /// Assess whether `destination` must be (re)built from `source`.
    ///
    /// `key` is the store key of the source file. The store is only read.
    pub async fn assess(
        &self,
        store: Option<&MetadataStore>,
        source: &Path,
        destination: &Path,
        key: &str,
    ) -> Result<Verdict> {
        if self.exclusions.is_excluded(destination) {
            return Ok(Verdict::Excluded);
        }

        let stamp = FileStamp::of(source).await?;

        let dest_is_file = match fs::metadata(destination).await {
            Ok(metadata) => metadata.is_file(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                return Err(MirrorError::comparison_error(
                    source,
                    destination,
                    format!("Failed to read destination metadata: {}", e),
                ))
            }
        };
        if !dest_is_file {
            return Ok(Verdict::Missing(stamp));
        }

        if self.same_content(source, destination).await? {
            return Ok(Verdict::Identical(stamp));
        }

        let Some(store) = store else {
            return Ok(Verdict::Differs(stamp));
        };

        Ok(match store.get(key) {
            None => Verdict::Untracked(stamp),
            Some(stored) if stored.size != stamp.size || stored.last_modified != stamp.last_modified => {
                Verdict::Stale(stamp)
            }
            Some(_) => Verdict::Fresh(stamp),
        })
    }

    /// Byte-for-byte comparison of two files
    pub async fn same_content(&self, source: &Path, destination: &Path) -> Result<bool> {
        let source_len = fs::metadata(source).await?.len();
        let dest_len = fs::metadata(destination).await?.len();
        if source_len != dest_len {
            return Ok(false);
        }

        let source_file = fs::File::open(source).await.map_err(|e| {
            MirrorError::comparison_error(source, destination, format!("Failed to open source file: {}", e))
        })?;
        let dest_file = fs::File::open(destination).await.map_err(|e| {
            MirrorError::comparison_error(source, destination, format!("Failed to open destination file: {}", e))
        })?;

        let mut source_reader = BufReader::new(source_file);
        let mut dest_reader = BufReader::new(dest_file);

        let mut source_buffer = vec![0u8; self.buffer_size];
        let mut dest_buffer = vec![0u8; self.buffer_size];

        loop {
            let source_bytes = read_full(&mut source_reader, &mut source_buffer).await.map_err(|e| {
                MirrorError::comparison_error(source, destination, format!("Failed to read source file: {}", e))
            })?;
            let dest_bytes = read_full(&mut dest_reader, &mut dest_buffer).await.map_err(|e| {
                MirrorError::comparison_error(source, destination, format!("Failed to read destination file: {}", e))
            })?;

            if source_bytes != dest_bytes {
                return Ok(false);
            }
            if source_bytes == 0 {
                return Ok(true);
            }
            if source_buffer[..source_bytes] != dest_buffer[..dest_bytes] {
                return Ok(false);
            }
        }
    }
}

/// Fill `buffer` as far as the reader allows; short only at end of file
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let n = reader.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
