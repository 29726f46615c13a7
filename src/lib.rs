//! RepoWriter: patch application, sandboxed validation and rollback for a
//! shared working tree.
//!
//! # Architecture
//!
//! Every mutation starts as a [`Patch`]: full replacement content or a
//! unified diff for one tree-relative path. Paths go through [`PathGuard`]
//! before any I/O. From there:
//!
//! - [`Validator`] / [`SandboxRunner`] copy the tree into a temporary
//!   directory, apply the patches there and run typecheck, tests and lint
//!   with a deadline. The real tree is only read.
//! - [`ApplyEngine`] computes every new file first, writes only if all
//!   patches succeed, and commits the result through the [`Vcs`] trait.
//!   The returned [`RollbackMetadata`] restores every touched path.
//! - [`RollbackManager`] undoes a change by resetting to a commit's parent
//!   or by replaying captured contents as a new commit.
//!
//! All mutating components share a [`RepoHandle`], which carries the root,
//! the VCS client, the commit author and a single-writer lock.
//!
//! # Safety
//!
//! - Path resolution is lexical and rejects `..` escapes, absolute paths,
//!   null bytes and forbidden prefixes
//! - Atomic file writes (tempfile + fsync + rename)
//! - Diff hunks must match their context exactly
//! - Subprocess output is bounded and every command has a hard deadline
//!
//! # Example
//!
//! ```no_run
//! use repowriter::{ApplyEngine, ApplyMode, Author, Patch, PatchSet, RepoHandle};
//!
//! let repo = RepoHandle::git("/path/to/tree", Author::default())?.with_forbidden([".git"]);
//! let engine = ApplyEngine::new(repo);
//!
//! let patches = PatchSet::new(vec![Patch::content("README.md", "hello\n")]);
//! let result = engine.apply(&patches, ApplyMode::Apply);
//! println!("{}", serde_json::to_string_pretty(&result)?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod apply;
pub mod config;
pub mod diff;
pub mod edit;
pub mod patch;
pub mod repo;
pub mod rollback;
pub mod safety;
pub mod sandbox;
pub mod validator;
pub mod vcs;

// Re-exports
pub use apply::{
    plan_patch_set, write_plan, AppliedEntry, ApplyEngine, ApplyError, ApplyMode, ApplyResult,
    Plan, PlannedChange, ResultMode, RollbackMetadata,
};
pub use config::{load_from_path, load_from_str, ConfigError, RepoConfig};
pub use diff::{apply_unified_diff, render_unified_diff, DiffError, UnifiedDiff};
pub use edit::{Edit, EditError, EditVerification};
pub use patch::{Patch, PatchBody, PatchRequest, PatchSet, PatchValidationError, RequestMode};
pub use repo::RepoHandle;
pub use rollback::{RollbackError, RollbackManager, RollbackOutcome, RollbackRequest};
pub use safety::{PathGuard, SafetyError};
pub use sandbox::{
    CommandExecutor, CommandLine, CommandResult, SandboxCommand, SandboxError, SandboxOptions,
    SandboxResult, SandboxRunner, Step, TreeCopier,
};
pub use validator::{ValidateError, ValidateOptions, Validator};
pub use vcs::{Author, GitCli, Vcs, VcsError};
