//! Root boundary checks for caller-supplied paths.
//!
//! Every component resolves tree-relative paths through [`PathGuard`] before
//! touching the filesystem. Resolution is purely lexical: no `stat`, no
//! `canonicalize`, no symlink reads happen in [`PathGuard::resolve`].

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Validates caller-supplied relative paths against a fixed root.
#[derive(Debug, Clone)]
pub struct PathGuard {
    /// Lexically normalized absolute root
    root: PathBuf,
    /// Tree-relative prefixes that may never be written
    forbidden: Vec<PathBuf>,
}

#[derive(Error, Debug)]
pub enum SafetyError {
    #[error("path is empty")]
    Empty,

    #[error("path contains a null byte: {path:?}")]
    NullByte { path: String },

    #[error("absolute path not allowed: {path}")]
    Absolute { path: String },

    #[error("path escapes root: {path} (root: {root})")]
    OutsideRoot { path: String, root: PathBuf },

    #[error("path is in forbidden directory: {path} (forbidden: {forbidden})")]
    Forbidden { path: String, forbidden: PathBuf },

    #[error("root must be an absolute path: {0}")]
    RelativeRoot(PathBuf),

    #[error("failed to canonicalize root: {0}")]
    Canonicalize(#[from] std::io::Error),
}

impl PathGuard {
    /// Create a guard for an absolute root without touching the filesystem.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, SafetyError> {
        let root = root.as_ref();
        if !root.is_absolute() {
            return Err(SafetyError::RelativeRoot(root.to_path_buf()));
        }
        Ok(Self {
            root: normalize(root),
            forbidden: Vec::new(),
        })
    }

    /// Create a guard for an existing directory, resolving symlinks in the root.
    pub fn canonical(root: impl AsRef<Path>) -> Result<Self, SafetyError> {
        let root = root.as_ref().canonicalize()?;
        Self::new(root)
    }

    /// Refuse any path under the given tree-relative prefixes.
    pub fn with_forbidden<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.forbidden = prefixes
            .into_iter()
            .map(|p| normalize(Path::new(p.as_ref())))
            .filter(|p| !p.as_os_str().is_empty())
            .collect();
        self
    }

    /// Same forbidden prefixes, different root. Used for sandbox copies.
    pub fn rebased(&self, root: impl AsRef<Path>) -> Result<Self, SafetyError> {
        let mut guard = Self::new(root)?;
        guard.forbidden = self.forbidden.clone();
        Ok(guard)
    }

    /// Resolve a caller-supplied path to an absolute path inside the root.
    ///
    /// Absolute candidates are accepted only when they name the root itself.
    /// Relative candidates must land strictly below the root after `.` and
    /// `..` components are folded.
    pub fn resolve(&self, candidate: &str) -> Result<PathBuf, SafetyError> {
        if candidate.trim().is_empty() {
            return Err(SafetyError::Empty);
        }
        if candidate.contains('\0') {
            return Err(SafetyError::NullByte {
                path: candidate.to_string(),
            });
        }

        let path = Path::new(candidate);
        if path.is_absolute() || path.has_root() {
            if normalize(path) == self.root {
                return Ok(self.root.clone());
            }
            return Err(SafetyError::Absolute {
                path: candidate.to_string(),
            });
        }

        let joined = normalize(&self.root.join(path));
        if joined == self.root || !joined.starts_with(&self.root) {
            return Err(SafetyError::OutsideRoot {
                path: candidate.to_string(),
                root: self.root.clone(),
            });
        }

        if let Ok(relative) = joined.strip_prefix(&self.root) {
            for forbidden in &self.forbidden {
                if relative.starts_with(forbidden) {
                    return Err(SafetyError::Forbidden {
                        path: candidate.to_string(),
                        forbidden: forbidden.clone(),
                    });
                }
            }
        }

        Ok(joined)
    }

    /// Resolve and return the normalized tree-relative form with `/` separators.
    ///
    /// This is the spelling handed to the VCS when staging.
    pub fn relative(&self, candidate: &str) -> Result<String, SafetyError> {
        let absolute = self.resolve(candidate)?;
        let relative = absolute
            .strip_prefix(&self.root)
            .map_err(|_| SafetyError::OutsideRoot {
                path: candidate.to_string(),
                root: self.root.clone(),
            })?;
        Ok(relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"))
    }

    /// Get the root.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Resolve `candidate` against `root` with no forbidden prefixes.
pub fn resolve(root: impl AsRef<Path>, candidate: &str) -> Result<PathBuf, SafetyError> {
    PathGuard::new(root)?.resolve(candidate)
}

/// Fold `.` and `..` components without consulting the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                // Popping past the root is a no-op for absolute paths; for
                // relative paths keep the `..` so the prefix check fails.
                if !out.pop() && !path.has_root() {
                    out.push("..");
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}
