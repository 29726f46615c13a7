//! Version control collaborator.
//!
//! The core only needs four capabilities from a VCS: stage-and-commit,
//! parent resolution, hard reset, and ref resolution. [`GitCli`] provides
//! them by shelling out to `git`; tests substitute their own [`Vcs`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use thiserror::Error;

/// Commit identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub name: String,
    pub email: String,
}

impl Author {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

impl Default for Author {
    fn default() -> Self {
        Self::new("RepoWriter", "repowriter@localhost")
    }
}

impl fmt::Display for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

#[derive(Error, Debug)]
pub enum VcsError {
    #[error("failed to spawn git: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("unknown revision: {0}")]
    UnknownRevision(String),

    #[error("git produced unexpected output: {0}")]
    UnexpectedOutput(String),
}

/// VCS capabilities the apply and rollback paths rely on.
pub trait Vcs: Send + Sync {
    /// Stage the given tree-relative paths (including deletions) and commit them.
    fn stage_and_commit(
        &self,
        paths: &[String],
        message: &str,
        author: &Author,
    ) -> Result<String, VcsError>;

    /// Resolve the first parent of a commit.
    fn resolve_parent(&self, commit: &str) -> Result<String, VcsError>;

    /// Reset index and working tree to `reference`, discarding local changes.
    fn hard_reset(&self, reference: &str) -> Result<(), VcsError>;

    /// Resolve a ref to a full commit hash.
    fn rev_parse(&self, reference: &str) -> Result<String, VcsError>;
}

/// [`Vcs`] backed by the `git` binary.
#[derive(Debug, Clone)]
pub struct GitCli {
    root: PathBuf,
}

impl GitCli {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run(&self, args: &[&str]) -> Result<Output, VcsError> {
        tracing::debug!(root = %self.root.display(), ?args, "git");
        Ok(Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()?)
    }

    fn run_checked(&self, args: &[&str]) -> Result<String, VcsError> {
        let output = self.run(args)?;
        if !output.status.success() {
            return Err(VcsError::CommandFailed {
                command: args.first().copied().unwrap_or("").to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Create a repository at the root if there is none.
    pub fn init(&self) -> Result<(), VcsError> {
        self.run_checked(&["init", "--quiet"]).map(|_| ())
    }
}

impl Vcs for GitCli {
    fn stage_and_commit(
        &self,
        paths: &[String],
        message: &str,
        author: &Author,
    ) -> Result<String, VcsError> {
        // Present paths are added; missing ones stage a deletion if tracked.
        let (present, missing): (Vec<&String>, Vec<&String>) = paths
            .iter()
            .partition(|p| self.root.join(p.as_str()).symlink_metadata().is_ok());
        if !present.is_empty() {
            let mut add = vec!["add", "--"];
            add.extend(present.iter().map(|p| p.as_str()));
            self.run_checked(&add)?;
        }
        if !missing.is_empty() {
            let mut rm = vec!["rm", "--cached", "--ignore-unmatch", "--quiet", "--"];
            rm.extend(missing.iter().map(|p| p.as_str()));
            self.run_checked(&rm)?;
        }

        let name = format!("user.name={}", author.name);
        let email = format!("user.email={}", author.email);
        let author_arg = author.to_string();
        let commit = [
            "-c",
            name.as_str(),
            "-c",
            email.as_str(),
            "commit",
            "--quiet",
            "--allow-empty",
            "--no-verify",
            "-m",
            message,
            "--author",
            author_arg.as_str(),
        ];
        self.run_checked(&commit)?;

        self.rev_parse("HEAD")
    }

    fn resolve_parent(&self, commit: &str) -> Result<String, VcsError> {
        let rev = format!("{commit}^1^{{commit}}");
        let output = self.run(&["rev-parse", "--verify", "--quiet", &rev])?;
        if !output.status.success() {
            return Err(VcsError::UnknownRevision(format!("{commit}^")));
        }
        parse_sha(&output.stdout)
    }

    fn hard_reset(&self, reference: &str) -> Result<(), VcsError> {
        self.run_checked(&["reset", "--hard", "--quiet", reference])
            .map(|_| ())
    }

    fn rev_parse(&self, reference: &str) -> Result<String, VcsError> {
        let rev = format!("{reference}^{{commit}}");
        let output = self.run(&["rev-parse", "--verify", "--quiet", &rev])?;
        if !output.status.success() {
            return Err(VcsError::UnknownRevision(reference.to_string()));
        }
        parse_sha(&output.stdout)
    }
}

fn parse_sha(stdout: &[u8]) -> Result<String, VcsError> {
    let sha = String::from_utf8_lossy(stdout).trim().to_string();
    if sha.len() < 40 || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(VcsError::UnexpectedOutput(sha));
    }
    Ok(sha)
}
