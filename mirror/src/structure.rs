//! Directory structure comparison for verifying a mirror.
//!
//! Two trees are reduced to sorted lists of relative paths with extensions
//! stripped, so `a/b.flac` in the source lines up with `a/b.opus` in the
//! target, and the lists are compared as a zero-context unified diff.

use std::collections::HashSet;
use std::path::Path;
use walkdir::WalkDir;

use crate::error::{MirrorError, Result};
use crate::metadata::relative_key;

/// Sorted, extension-less relative paths of every file under `dir`.
///
/// Files whose base name is in `ignored` are left out.
pub fn structure(dir: &Path, ignored: &HashSet<String>) -> Result<Vec<String>> {
    let mut paths = Vec::new();

    for entry in WalkDir::new(dir).min_depth(1) {
        let entry = entry.map_err(|e| MirrorError::walk_error(dir, e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy();
        if ignored.contains(&*name) {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| MirrorError::path_error(entry.path(), e.to_string()))?;
        paths.push(relative_key(&relative.with_extension("")));
    }

    paths.sort();
    Ok(paths)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Equal,
    Delete(usize),
    Insert(usize),
}

/// Zero-context unified diff of two sorted line lists.
///
/// Returns no lines at all when the lists are equal.
pub fn unified_diff(from_label: &str, to_label: &str, from: &[String], to: &[String]) -> Vec<String> {
    let ops = merge_ops(from, to);
    let mut lines = Vec::new();

    let mut i = 0;
    // positions in `from` / `to` before ops[i]
    let (mut a_pos, mut b_pos) = (0usize, 0usize);
    while i < ops.len() {
        if ops[i] == Op::Equal {
            a_pos += 1;
            b_pos += 1;
            i += 1;
            continue;
        }

        let (a_start, b_start) = (a_pos, b_pos);
        let mut deleted = Vec::new();
        let mut inserted = Vec::new();
        while i < ops.len() && ops[i] != Op::Equal {
            match ops[i] {
                Op::Delete(idx) => {
                    deleted.push(&from[idx]);
                    a_pos += 1;
                }
                Op::Insert(idx) => {
                    inserted.push(&to[idx]);
                    b_pos += 1;
                }
                Op::Equal => unreachable!(),
            }
            i += 1;
        }

        if lines.is_empty() {
            lines.push(format!("--- {}", from_label));
            lines.push(format!("+++ {}", to_label));
        }
        lines.push(format!(
            "@@ -{} +{} @@",
            format_range(a_start, deleted.len()),
            format_range(b_start, inserted.len())
        ));
        lines.extend(deleted.into_iter().map(|line| format!("-{}", line)));
        lines.extend(inserted.into_iter().map(|line| format!("+{}", line)));
    }

    lines
}

/// Edit script of two sorted lists; the longest common subsequence of
/// sorted sequences is their multiset intersection.
fn merge_ops(from: &[String], to: &[String]) -> Vec<Op> {
    let mut ops = Vec::with_capacity(from.len() + to.len());
    let (mut i, mut j) = (0, 0);

    while i < from.len() && j < to.len() {
        match from[i].cmp(&to[j]) {
            std::cmp::Ordering::Equal => {
                ops.push(Op::Equal);
                i += 1;
                j += 1;
            }
            std::cmp::Ordering::Less => {
                ops.push(Op::Delete(i));
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                ops.push(Op::Insert(j));
                j += 1;
            }
        }
    }
    ops.extend((i..from.len()).map(Op::Delete));
    ops.extend((j..to.len()).map(Op::Insert));
    ops
}

/// Hunk range in unified diff notation (1-based, `start,0` for empty ranges)
fn format_range(start: usize, len: usize) -> String {
    match len {
        0 => format!("{},0", start),
        1 => format!("{}", start + 1),
        _ => format!("{},{}", start + 1, len),
    }
}

/// Diff the structures of two directories; empty when they match
pub fn diff_dirs(from_dir: &Path, to_dir: &Path, ignored: &HashSet<String>) -> Result<Vec<String>> {
    let from = structure(from_dir, ignored)?;
    let to = structure(to_dir, ignored)?;
    Ok(unified_diff(
        &from_dir.to_string_lossy(),
        &to_dir.to_string_lossy(),
        &from,
        &to,
    ))
}
