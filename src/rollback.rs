//! Undoing earlier mutations of the working tree.
//!
//! Two mechanisms, picked by what the caller kept around:
//! - a commit hash: hard reset to that commit's parent (destructive)
//! - captured previous contents: replay them and commit the result

use crate::apply::RollbackMetadata;
use crate::edit::{read_optional, restore, EditError};
use crate::repo::RepoHandle;
use crate::safety::SafetyError;
use crate::vcs::VcsError;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RollbackError {
    #[error("commit not found: {0}")]
    CommitNotFound(String),

    #[error("commit {0} has no parent to roll back to")]
    NoParentCommit(String),

    #[error("failed to reset working tree to {target}: {source}")]
    Reset {
        target: String,
        #[source]
        source: VcsError,
    },

    #[error("{path}: {source}")]
    Path {
        path: String,
        #[source]
        source: SafetyError,
    },

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: EditError,
    },

    #[error("rollback commit failed: {0}")]
    Commit(#[source] VcsError),

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error("nothing to restore")]
    NothingToRestore,
}

/// Wire payload for the rollback entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RollbackRequest {
    Commit {
        #[serde(rename = "commitSha")]
        commit_sha: String,
    },
    Metadata {
        #[serde(rename = "rollbackMetadata")]
        rollback_metadata: RollbackMetadata,
    },
    Contents {
        #[serde(rename = "previousContents")]
        previous_contents: BTreeMap<String, Option<String>>,
    },
}

/// What a rollback did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[must_use]
pub struct RollbackOutcome {
    /// Corrective commit created by a content replay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    /// Commit the tree was reset to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_to: Option<String>,
    pub changed: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RollbackManager {
    repo: RepoHandle,
}

impl RollbackManager {
    pub fn new(repo: RepoHandle) -> Self {
        Self { repo }
    }

    pub fn handle(&self, request: &RollbackRequest) -> Result<RollbackOutcome, RollbackError> {
        match request {
            RollbackRequest::Commit { commit_sha } => self.rollback_commit(commit_sha),
            RollbackRequest::Metadata { rollback_metadata } => {
                self.apply_rollback(&rollback_metadata.previous_contents)
            }
            RollbackRequest::Contents { previous_contents } => {
                self.apply_rollback(previous_contents)
            }
        }
    }

    /// Hard-reset the working tree to the parent of `commit`.
    ///
    /// Uncommitted changes in the tree are discarded.
    pub fn rollback_commit(&self, commit: &str) -> Result<RollbackOutcome, RollbackError> {
        let _writer = self.repo.lock_writer();
        let vcs = self.repo.vcs();

        let resolved = match vcs.rev_parse(commit) {
            Ok(sha) => sha,
            Err(VcsError::UnknownRevision(_)) => {
                return Err(RollbackError::CommitNotFound(commit.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let parent = match vcs.resolve_parent(&resolved) {
            Ok(parent) => parent,
            Err(VcsError::UnknownRevision(_)) => return Err(RollbackError::NoParentCommit(resolved)),
            Err(e) => return Err(e.into()),
        };

        vcs.hard_reset(&parent)
            .map_err(|source| RollbackError::Reset {
                target: parent.clone(),
                source,
            })?;
        tracing::info!(commit = %resolved, parent = %parent, "reset working tree to parent");

        Ok(RollbackOutcome {
            commit_sha: None,
            reset_to: Some(parent),
            changed: Vec::new(),
        })
    }

    /// Replay captured contents (`None` deletes) and commit the result.
    ///
    /// The current state of every target is captured first. If a mutation
    /// fails, paths already mutated are put back before the error returns.
    pub fn apply_rollback(
        &self,
        previous_contents: &BTreeMap<String, Option<String>>,
    ) -> Result<RollbackOutcome, RollbackError> {
        if previous_contents.is_empty() {
            return Err(RollbackError::NothingToRestore);
        }
        let _writer = self.repo.lock_writer();
        let guard = self.repo.guard();

        let mut targets: Vec<(&String, PathBuf, &Option<String>)> =
            Vec::with_capacity(previous_contents.len());
        for (path, content) in previous_contents {
            let target = guard.resolve(path).map_err(|source| RollbackError::Path {
                path: path.clone(),
                source,
            })?;
            targets.push((path, target, content));
        }

        let mut backups = Vec::with_capacity(targets.len());
        for (path, target, _) in &targets {
            let current = read_optional(target).map_err(|source| RollbackError::Io {
                path: (*path).clone(),
                source,
            })?;
            backups.push(current);
        }

        for (idx, (path, target, content)) in targets.iter().enumerate() {
            if let Err(source) = restore(target, content.as_deref()) {
                tracing::warn!(path = %path, error = %source, "rollback write failed, restoring backups");
                for ((done_path, done_target, _), backup) in
                    targets[..idx].iter().zip(&backups).rev()
                {
                    if let Err(e) = restore(done_target, backup.as_deref()) {
                        tracing::warn!(path = %done_path, error = %e, "failed to restore backup");
                    }
                }
                return Err(RollbackError::Io {
                    path: (*path).clone(),
                    source,
                });
            }
        }

        let mut changed = Vec::with_capacity(targets.len());
        for (path, _, _) in &targets {
            changed.push(guard.relative(path).map_err(|source| RollbackError::Path {
                path: (*path).clone(),
                source,
            })?);
        }

        let message = rollback_message(changed.len());
        let sha = self
            .repo
            .vcs()
            .stage_and_commit(&changed, &message, self.repo.author())
            .map_err(RollbackError::Commit)?;
        tracing::info!(commit = %sha, files = changed.len(), "committed rollback");

        Ok(RollbackOutcome {
            commit_sha: Some(sha),
            reset_to: None,
            changed,
        })
    }
}

fn rollback_message(files: usize) -> String {
    format!(
        "rollback: restore {files} file(s) at {}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}
