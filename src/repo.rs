use crate::safety::{PathGuard, SafetyError};
use crate::vcs::{Author, GitCli, Vcs};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Everything a mutating component needs to know about one working tree.
///
/// Clones share the VCS client and the writer lock, so every engine built
/// from the same handle serializes its mutations.
#[derive(Clone)]
pub struct RepoHandle {
    guard: PathGuard,
    vcs: Arc<dyn Vcs>,
    author: Author,
    writer: Arc<Mutex<()>>,
}

impl RepoHandle {
    pub fn new(guard: PathGuard, vcs: Arc<dyn Vcs>, author: Author) -> Self {
        Self {
            guard,
            vcs,
            author,
            writer: Arc::new(Mutex::new(())),
        }
    }

    /// Open an existing directory backed by the `git` binary.
    pub fn git(root: impl AsRef<Path>, author: Author) -> Result<Self, SafetyError> {
        let guard = PathGuard::canonical(root)?;
        let vcs = Arc::new(GitCli::new(guard.root()));
        Ok(Self::new(guard, vcs, author))
    }

    /// Refuse any path under the given tree-relative prefixes.
    pub fn with_forbidden<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.guard = self.guard.with_forbidden(prefixes);
        self
    }

    pub fn root(&self) -> &Path {
        self.guard.root()
    }

    pub fn guard(&self) -> &PathGuard {
        &self.guard
    }

    pub fn vcs(&self) -> &dyn Vcs {
        self.vcs.as_ref()
    }

    pub fn author(&self) -> &Author {
        &self.author
    }

    /// Hold the single-writer lock for the duration of a mutation.
    pub fn lock_writer(&self) -> MutexGuard<'_, ()> {
        // A panicked writer leaves nothing behind in `()`; keep going.
        self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for RepoHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoHandle")
            .field("root", &self.guard.root())
            .field("author", &self.author)
            .finish_non_exhaustive()
    }
}
