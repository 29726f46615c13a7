//! Duplicating a source tree into a sandbox directory.

use super::SandboxError;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use xxhash_rust::xxh3::xxh3_64;

/// Counts from one copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub files: usize,
    pub dirs: usize,
    pub symlinks: usize,
    pub bytes: u64,
}

/// Strategy for populating a sandbox from the source tree.
///
/// Implementations must never write under `source`.
pub trait TreeCopier: Send + Sync {
    /// Copy `source` into the existing directory `dest`, skipping any entry
    /// whose tree-relative path starts with one of `exclude`.
    fn copy_tree(
        &self,
        source: &Path,
        dest: &Path,
        exclude: &[String],
    ) -> Result<CopyStats, SandboxError>;
}

/// Recursive copy via `walkdir`. Symlinks are recreated, not followed.
#[derive(Debug, Clone, Copy, Default)]
pub struct WalkdirCopier;

impl TreeCopier for WalkdirCopier {
    fn copy_tree(
        &self,
        source: &Path,
        dest: &Path,
        exclude: &[String],
    ) -> Result<CopyStats, SandboxError> {
        let mut stats = CopyStats::default();
        // `dest` may sit inside `source`, e.g. with TMPDIR under the tree
        let source_real = canonical_or_self(source);
        let dest_real = canonical_or_self(dest);
        let walker = WalkDir::new(source)
            .follow_links(false)
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| match entry.path().strip_prefix(source) {
                Ok(rel) => !is_excluded(rel, exclude) && source_real.join(rel) != dest_real,
                Err(_) => true,
            });

        for entry in walker {
            let entry = entry?;
            let rel = match entry.path().strip_prefix(source) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            let target = dest.join(rel);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                fs::create_dir_all(&target).map_err(|source| SandboxError::Copy {
                    path: target.clone(),
                    source,
                })?;
                stats.dirs += 1;
            } else if file_type.is_symlink() {
                copy_symlink(entry.path(), &target)?;
                stats.symlinks += 1;
            } else if file_type.is_file() {
                let bytes = fs::copy(entry.path(), &target).map_err(|source| SandboxError::Copy {
                    path: target.clone(),
                    source,
                })?;
                stats.files += 1;
                stats.bytes += bytes;
            } else {
                tracing::debug!(path = %entry.path().display(), "skipping special file");
            }
        }

        Ok(stats)
    }
}

fn canonical_or_self(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

fn is_excluded(rel: &Path, exclude: &[String]) -> bool {
    exclude
        .iter()
        .any(|prefix| !prefix.is_empty() && rel.starts_with(prefix))
}

#[cfg(unix)]
fn copy_symlink(src: &Path, target: &Path) -> Result<(), SandboxError> {
    let link = fs::read_link(src).map_err(|source| SandboxError::Copy {
        path: src.to_path_buf(),
        source,
    })?;
    std::os::unix::fs::symlink(&link, target).map_err(|source| SandboxError::Copy {
        path: target.to_path_buf(),
        source,
    })
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, _target: &Path) -> Result<(), SandboxError> {
    tracing::debug!(path = %src.display(), "symlinks are not copied on this platform");
    Ok(())
}

/// Content hash of every regular file under `root`, keyed by `/`-separated
/// relative path. Two equal fingerprints mean no file was added, removed or
/// changed.
pub fn fingerprint_tree(root: &Path) -> Result<BTreeMap<String, u64>, SandboxError> {
    let mut hashes = BTreeMap::new();
    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let data = fs::read(entry.path()).map_err(|source| SandboxError::Copy {
            path: entry.path().to_path_buf(),
            source,
        })?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        hashes.insert(rel, xxh3_64(&data));
    }
    Ok(hashes)
}
