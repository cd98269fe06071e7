//! Exclusion patterns matched against destination base names

use std::path::Path;
use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::{MirrorError, Result};

/// Glob patterns that veto migration of a destination outright
#[derive(Debug, Clone)]
pub struct ExclusionSet {
    patterns: Vec<String>,
    set: GlobSet,
}

impl Default for ExclusionSet {
    fn default() -> Self {
        Self {
            patterns: Vec::new(),
            set: GlobSet::empty(),
        }
    }
}

impl ExclusionSet {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();

        for pattern in patterns {
            let pattern = pattern.as_ref();
            let glob = Glob::new(pattern).map_err(|e| {
                MirrorError::Pattern(format!("Failed to compile glob '{}': {}", pattern, e))
            })?;
            builder.add(glob);
        }

        let set = builder.build().map_err(|e| {
            MirrorError::Pattern(format!("Failed to build globset: {}", e))
        })?;

        Ok(Self {
            patterns: patterns.iter().map(|p| p.as_ref().to_string()).collect(),
            set,
        })
    }

    /// True if the base name of `destination` matches any pattern
    pub fn is_excluded(&self, destination: &Path) -> bool {
        if self.set.is_empty() {
            return false;
        }
        destination
            .file_name()
            .map(|name| self.set.is_match(Path::new(name)))
            .unwrap_or(false)
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
