//! Patch application against a working tree.
//!
//! Application is two-phase. [`plan_patch_set`] resolves every path, reads
//! current content and computes new content without writing anything;
//! [`write_plan`] then writes the whole plan. A patch set with any failing
//! patch never reaches the write phase, so the tree is untouched and no
//! commit is made.

use crate::diff::{apply_unified_diff, render_unified_diff, DiffError};
use crate::edit::{read_optional, restore, EditError};
use crate::patch::{Patch, PatchBody, PatchSet, PatchValidationError};
use crate::repo::RepoHandle;
use crate::safety::{PathGuard, SafetyError};
use crate::vcs::VcsError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use thiserror::Error;

/// Requested application mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyMode {
    /// Compute results and rollback metadata, write nothing
    Dry,
    /// Write and commit
    Apply,
}

/// Mode recorded in an [`ApplyResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultMode {
    Dry,
    Apply,
    Rollback,
}

impl From<ApplyMode> for ResultMode {
    fn from(mode: ApplyMode) -> Self {
        match mode {
            ApplyMode::Dry => ResultMode::Dry,
            ApplyMode::Apply => ResultMode::Apply,
        }
    }
}

/// One touched path and what was there before.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedEntry {
    pub path: String,
    pub was_created: bool,
    /// `None` means the file did not exist
    pub previous_content: Option<String>,
}

/// Pre-mutation state sufficient to restore every touched path.
///
/// Replaying it (`None` deletes, `Some` overwrites) restores byte-identical
/// content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackMetadata {
    pub previous_contents: BTreeMap<String, Option<String>>,
}

impl RollbackMetadata {
    pub fn is_empty(&self) -> bool {
        self.previous_contents.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResult {
    pub ok: bool,
    pub mode: ResultMode,
    pub applied: Vec<AppliedEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_metadata: Option<RollbackMetadata>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ApplyResult {
    fn failed(mode: ResultMode, errors: Vec<String>) -> Self {
        Self {
            ok: false,
            mode,
            applied: Vec::new(),
            commit_sha: None,
            rollback_metadata: None,
            errors,
        }
    }
}

#[derive(Error, Debug)]
pub enum ApplyError {
    #[error(transparent)]
    Path(#[from] SafetyError),

    #[error("Failed to apply patch for {path}")]
    PatchFailed {
        path: String,
        #[source]
        source: DiffError,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: EditError,
    },

    #[error("{path} names the same file as {first}")]
    DuplicateTarget { path: String, first: String },

    #[error("commit failed: {0}")]
    Commit(#[from] VcsError),

    #[error(transparent)]
    InvalidPatchSet(#[from] PatchValidationError),
}

/// Computed outcome for one patch, not yet written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChange {
    /// Path as the caller spelled it
    pub path: String,
    /// Resolved absolute target
    pub target: PathBuf,
    pub previous: Option<String>,
    pub next: String,
}

impl PlannedChange {
    pub fn entry(&self) -> AppliedEntry {
        AppliedEntry {
            path: self.path.clone(),
            was_created: self.previous.is_none(),
            previous_content: self.previous.clone(),
        }
    }

    /// Unified diff from the current to the planned content.
    pub fn preview(&self) -> String {
        render_unified_diff(&self.path, self.previous.as_deref(), Some(&self.next))
    }
}

/// Every change of a patch set, computed and validated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    changes: Vec<PlannedChange>,
}

impl Plan {
    pub fn changes(&self) -> &[PlannedChange] {
        &self.changes
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn entries(&self) -> Vec<AppliedEntry> {
        self.changes.iter().map(PlannedChange::entry).collect()
    }

    pub fn rollback_metadata(&self) -> RollbackMetadata {
        RollbackMetadata {
            previous_contents: self
                .changes
                .iter()
                .map(|c| (c.path.clone(), c.previous.clone()))
                .collect(),
        }
    }
}

/// A failure tied to the path it happened on.
pub type PathFailure = (String, ApplyError);

/// Compute new content for every patch without writing.
///
/// All paths are resolved before any file is read; a path violation fails
/// the whole set with no I/O at all. Otherwise every patch is evaluated and
/// all failures are reported together.
pub fn plan_patch_set(guard: &PathGuard, patches: &PatchSet) -> Result<Plan, Vec<PathFailure>> {
    let mut targets = Vec::with_capacity(patches.len());
    let mut failures = Vec::new();
    // Spellings like `a.txt` and `./a.txt` collide only after resolution
    let mut claimed: HashMap<PathBuf, &str> = HashMap::new();
    for patch in patches {
        match guard.resolve(&patch.path) {
            Ok(target) => {
                if let Some(first) = claimed.insert(target.clone(), &patch.path) {
                    failures.push((
                        patch.path.clone(),
                        ApplyError::DuplicateTarget {
                            path: patch.path.clone(),
                            first: first.to_string(),
                        },
                    ));
                }
                targets.push(target);
            }
            Err(e) => failures.push((patch.path.clone(), ApplyError::Path(e))),
        }
    }
    if !failures.is_empty() {
        return Err(failures);
    }

    let mut changes = Vec::with_capacity(patches.len());
    for (patch, target) in patches.iter().zip(targets) {
        match plan_patch(patch, target) {
            Ok(change) => changes.push(change),
            Err(e) => failures.push((patch.path.clone(), e)),
        }
    }
    if !failures.is_empty() {
        return Err(failures);
    }
    Ok(Plan { changes })
}

fn plan_patch(patch: &Patch, target: PathBuf) -> Result<PlannedChange, ApplyError> {
    let previous = read_optional(&target).map_err(|source| ApplyError::Io {
        path: patch.path.clone(),
        source,
    })?;

    let next = match &patch.body {
        PatchBody::Content(content) => content.clone(),
        PatchBody::Diff(diff) => apply_unified_diff(previous.as_deref().unwrap_or(""), diff)
            .map_err(|source| {
                tracing::debug!(path = %patch.path, error = %source, "diff did not apply");
                ApplyError::PatchFailed {
                    path: patch.path.clone(),
                    source,
                }
            })?,
    };

    Ok(PlannedChange {
        path: patch.path.clone(),
        target,
        previous,
        next,
    })
}

/// Write every planned change.
///
/// If a write fails, paths already written are put back to their previous
/// state before the failure is returned.
pub fn write_plan(plan: &Plan) -> Result<(), PathFailure> {
    for (idx, change) in plan.changes.iter().enumerate() {
        if let Err(source) = restore(&change.target, Some(&change.next)) {
            for done in plan.changes[..idx].iter().rev() {
                if let Err(e) = restore(&done.target, done.previous.as_deref()) {
                    tracing::warn!(path = %done.path, error = %e, "failed to restore after write failure");
                }
            }
            return Err((
                change.path.clone(),
                ApplyError::Io {
                    path: change.path.clone(),
                    source,
                },
            ));
        }
        tracing::debug!(path = %change.path, bytes = change.next.len(), "wrote");
    }
    Ok(())
}

/// Deterministic commit message: the single path, or `"<n> files"`.
pub fn commit_message(paths: &[String]) -> String {
    match paths {
        [single] => single.clone(),
        _ => format!("{} files", paths.len()),
    }
}

fn render_failures(failures: &[PathFailure]) -> Vec<String> {
    failures
        .iter()
        .map(|(path, error)| format!("{path}: {error}"))
        .collect()
}

/// Applies patch sets to the tree behind a [`RepoHandle`].
#[derive(Debug, Clone)]
pub struct ApplyEngine {
    repo: RepoHandle,
}

impl ApplyEngine {
    pub fn new(repo: RepoHandle) -> Self {
        Self { repo }
    }

    pub fn repo(&self) -> &RepoHandle {
        &self.repo
    }

    /// Validate and compute a patch set without writing.
    pub fn plan(&self, patches: &PatchSet) -> Result<Plan, Vec<PathFailure>> {
        if let Err(e) = patches.validate() {
            return Err(e
                .issues
                .iter()
                .map(|issue| {
                    let error = PatchValidationError {
                        issues: vec![issue.clone()],
                    };
                    (String::new(), ApplyError::InvalidPatchSet(error))
                })
                .collect());
        }
        plan_patch_set(self.repo.guard(), patches)
    }

    /// Apply a patch set in `mode`.
    ///
    /// Failures are reported inside the result, never as a panic or error.
    pub fn apply(&self, patches: &PatchSet, mode: ApplyMode) -> ApplyResult {
        let _writer = (mode == ApplyMode::Apply).then(|| self.repo.lock_writer());

        let plan = match self.plan(patches) {
            Ok(plan) => plan,
            Err(failures) => {
                tracing::info!(?mode, failed = failures.len(), "patch set rejected");
                let errors = failures
                    .iter()
                    .map(|(path, error)| {
                        if path.is_empty() {
                            error.to_string()
                        } else {
                            format!("{path}: {error}")
                        }
                    })
                    .collect();
                return ApplyResult::failed(mode.into(), errors);
            }
        };

        let mut result = ApplyResult {
            ok: true,
            mode: mode.into(),
            applied: plan.entries(),
            commit_sha: None,
            rollback_metadata: Some(plan.rollback_metadata()),
            errors: Vec::new(),
        };

        if mode == ApplyMode::Dry || plan.is_empty() {
            return result;
        }

        if let Err(failure) = write_plan(&plan) {
            // write_plan put back what it wrote; nothing stays applied
            result.ok = false;
            result.applied.clear();
            result.errors = render_failures(std::slice::from_ref(&failure));
            return result;
        }

        let mut paths = Vec::with_capacity(plan.changes.len());
        for change in &plan.changes {
            match self.repo.guard().relative(&change.path) {
                Ok(relative) => paths.push(relative),
                Err(e) => {
                    result.ok = false;
                    result.errors.push(format!("{}: {e}", change.path));
                    return result;
                }
            }
        }

        let message = commit_message(&paths);
        match self
            .repo
            .vcs()
            .stage_and_commit(&paths, &message, self.repo.author())
        {
            Ok(sha) => {
                tracing::info!(commit = %sha, files = paths.len(), "applied patch set");
                result.commit_sha = Some(sha);
            }
            Err(e) => {
                // Files stay written; the caller holds rollback metadata to undo them.
                tracing::warn!(error = %e, "patch set written but commit failed");
                result.ok = false;
                result.errors.push(ApplyError::Commit(e).to_string());
            }
        }
        result
    }

    /// Replay captured previous contents without staging or committing.
    ///
    /// The returned metadata describes the state just before this replay, so
    /// the replay itself can be undone.
    pub fn rollback(&self, metadata: &RollbackMetadata) -> ApplyResult {
        let _writer = self.repo.lock_writer();

        let mut targets = Vec::with_capacity(metadata.previous_contents.len());
        let mut failures = Vec::new();
        for path in metadata.previous_contents.keys() {
            match self.repo.guard().resolve(path) {
                Ok(target) => targets.push(target),
                Err(e) => failures.push((path.clone(), ApplyError::Path(e))),
            }
        }
        if !failures.is_empty() {
            return ApplyResult::failed(ResultMode::Rollback, render_failures(&failures));
        }

        let mut result = ApplyResult {
            ok: true,
            mode: ResultMode::Rollback,
            applied: Vec::new(),
            commit_sha: None,
            rollback_metadata: None,
            errors: Vec::new(),
        };
        let mut before = BTreeMap::new();

        for ((path, content), target) in metadata.previous_contents.iter().zip(targets) {
            let current = match read_optional(&target) {
                Ok(current) => current,
                Err(source) => {
                    failures.push((path.clone(), ApplyError::Io { path: path.clone(), source }));
                    continue;
                }
            };
            if let Err(source) = restore(&target, content.as_deref()) {
                failures.push((path.clone(), ApplyError::Io { path: path.clone(), source }));
                continue;
            }
            result.applied.push(AppliedEntry {
                path: path.clone(),
                was_created: current.is_none(),
                previous_content: current.clone(),
            });
            before.insert(path.clone(), current);
        }

        result.ok = failures.is_empty();
        result.errors = render_failures(&failures);
        result.rollback_metadata = Some(RollbackMetadata {
            previous_contents: before,
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::Patch;
    use crate::vcs::{Author, Vcs};
    use std::fs;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingVcs {
        commits: Mutex<Vec<(Vec<String>, String)>>,
        fail_commit: bool,
    }

    impl Vcs for RecordingVcs {
        fn stage_and_commit(
            &self,
            paths: &[String],
            message: &str,
            _author: &Author,
        ) -> Result<String, VcsError> {
            if self.fail_commit {
                return Err(VcsError::CommandFailed {
                    command: "commit".to_string(),
                    stderr: "simulated".to_string(),
                });
            }
            let mut commits = self.commits.lock().unwrap();
            commits.push((paths.to_vec(), message.to_string()));
            Ok(format!("{:040x}", commits.len()))
        }

        fn resolve_parent(&self, commit: &str) -> Result<String, VcsError> {
            Err(VcsError::UnknownRevision(commit.to_string()))
        }

        fn hard_reset(&self, _reference: &str) -> Result<(), VcsError> {
            Ok(())
        }

        fn rev_parse(&self, reference: &str) -> Result<String, VcsError> {
            Err(VcsError::UnknownRevision(reference.to_string()))
        }
    }

    fn engine(dir: &tempfile::TempDir, vcs: Arc<RecordingVcs>) -> ApplyEngine {
        let guard = PathGuard::canonical(dir.path()).unwrap().with_forbidden([".git"]);
        ApplyEngine::new(RepoHandle::new(guard, vcs, Author::default()))
    }

    #[test]
    fn test_apply_creates_file_and_commits() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = Arc::new(RecordingVcs::default());
        let engine = engine(&dir, vcs.clone());

        let patches = PatchSet::new(vec![Patch::content("a.txt", "hi")]);
        let result = engine.apply(&patches, ApplyMode::Apply);

        assert!(result.ok, "{:?}", result.errors);
        assert_eq!(
            result.applied,
            vec![AppliedEntry {
                path: "a.txt".to_string(),
                was_created: true,
                previous_content: None
            }]
        );
        assert!(result.commit_sha.is_some());
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "hi");

        let commits = vcs.commits.lock().unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].1, "a.txt");
    }

    #[test]
    fn test_mismatched_diff_fails_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "actual\n").unwrap();
        let vcs = Arc::new(RecordingVcs::default());
        let engine = engine(&dir, vcs.clone());

        let diff = "--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-expected\n+changed\n";
        let result = engine.apply(
            &PatchSet::new(vec![Patch::diff("a.txt", diff)]),
            ApplyMode::Apply,
        );

        assert!(!result.ok);
        assert_eq!(result.errors, vec!["a.txt: Failed to apply patch for a.txt"]);
        assert_eq!(
            fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "actual\n"
        );
        assert!(vcs.commits.lock().unwrap().is_empty());
    }

    #[test]
    fn test_later_failure_prevents_earlier_writes() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = Arc::new(RecordingVcs::default());
        let engine = engine(&dir, vcs.clone());

        let patches = PatchSet::new(vec![
            Patch::content("first.txt", "written?"),
            Patch::diff("second.txt", "@@ -1 +1 @@\n-nope\n+yes\n"),
        ]);
        let result = engine.apply(&patches, ApplyMode::Apply);

        assert!(!result.ok);
        assert!(!dir.path().join("first.txt").exists());
        assert!(vcs.commits.lock().unwrap().is_empty());
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = Arc::new(RecordingVcs::default());
        let engine = engine(&dir, vcs.clone());

        let patches = PatchSet::new(vec![
            Patch::content("a.txt", "v1"),
            Patch::content("b.txt", "v2"),
        ]);
        let result = engine.apply(&patches, ApplyMode::Dry);

        assert!(result.ok);
        assert_eq!(result.mode, ResultMode::Dry);
        assert!(!dir.path().join("a.txt").exists());
        assert!(!dir.path().join("b.txt").exists());
        let metadata = result.rollback_metadata.unwrap();
        assert_eq!(metadata.previous_contents.get("a.txt"), Some(&None));
        assert_eq!(metadata.previous_contents.get("b.txt"), Some(&None));
        assert!(vcs.commits.lock().unwrap().is_empty());
    }

    #[test]
    fn test_path_violation_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir, Arc::new(RecordingVcs::default()));

        for bad in ["../escape.txt", "/etc/passwd", ".git/config"] {
            let result = engine.apply(
                &PatchSet::new(vec![Patch::content(bad, "x")]),
                ApplyMode::Apply,
            );
            assert!(!result.ok, "{bad} should be rejected");
            assert!(result.errors[0].starts_with(bad));
        }
    }

    #[test]
    fn test_duplicate_paths_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir, Arc::new(RecordingVcs::default()));

        let result = engine.apply(
            &PatchSet::new(vec![Patch::content("a", "1"), Patch::content("a", "2")]),
            ApplyMode::Dry,
        );
        assert!(!result.ok);
        assert!(result.errors[0].contains("more than once"));
    }

    #[test]
    fn test_aliased_paths_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "one\ntwo\n").unwrap();
        let vcs = Arc::new(RecordingVcs::default());
        let engine = engine(&dir, vcs.clone());

        let patches = PatchSet::new(vec![
            Patch::diff("a.txt", "@@ -1 +1 @@\n-one\n+ONE\n"),
            Patch::diff("./a.txt", "@@ -2 +2 @@\n-two\n+TWO\n"),
        ]);
        let result = engine.apply(&patches, ApplyMode::Apply);

        assert!(!result.ok);
        assert_eq!(
            result.errors,
            vec!["./a.txt: ./a.txt names the same file as a.txt"]
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "one\ntwo\n"
        );
        assert!(vcs.commits.lock().unwrap().is_empty());
    }

    #[test]
    fn test_commit_message_shape() {
        let vcs = Arc::new(RecordingVcs::default());
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir, vcs.clone());

        let patches = PatchSet::new(vec![
            Patch::content("x/one.txt", "1"),
            Patch::content("two.txt", "2"),
        ]);
        assert!(engine.apply(&patches, ApplyMode::Apply).ok);

        let commits = vcs.commits.lock().unwrap();
        assert_eq!(commits[0].1, "2 files");
        assert_eq!(commits[0].0, vec!["x/one.txt", "two.txt"]);
    }

    #[test]
    fn test_commit_failure_keeps_rollback_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = Arc::new(RecordingVcs {
            fail_commit: true,
            ..Default::default()
        });
        let engine = engine(&dir, vcs);

        let result = engine.apply(
            &PatchSet::new(vec![Patch::content("a.txt", "hi")]),
            ApplyMode::Apply,
        );
        assert!(!result.ok);
        assert!(result.errors[0].starts_with("commit failed"));
        assert!(result.rollback_metadata.is_some());
        assert!(dir.path().join("a.txt").exists());
    }

    #[test]
    fn test_rollback_mode_replays_metadata() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("keep.txt"), "original\n").unwrap();
        let engine = engine(&dir, Arc::new(RecordingVcs::default()));

        let patches = PatchSet::new(vec![
            Patch::content("keep.txt", "changed\n"),
            Patch::content("new/file.txt", "fresh\n"),
        ]);
        let applied = engine.apply(&patches, ApplyMode::Apply);
        assert!(applied.ok);

        let undo = engine.rollback(applied.rollback_metadata.as_ref().unwrap());
        assert!(undo.ok, "{:?}", undo.errors);
        assert_eq!(undo.mode, ResultMode::Rollback);
        assert!(undo.commit_sha.is_none());
        assert_eq!(
            fs::read_to_string(dir.path().join("keep.txt")).unwrap(),
            "original\n"
        );
        assert!(!dir.path().join("new/file.txt").exists());

        // Undo of the undo brings the patched state back
        let redo = engine.rollback(undo.rollback_metadata.as_ref().unwrap());
        assert!(redo.ok);
        assert_eq!(
            fs::read_to_string(dir.path().join("new/file.txt")).unwrap(),
            "fresh\n"
        );
    }

    #[test]
    fn test_result_serializes_camel_case() {
        let result = ApplyResult {
            ok: true,
            mode: ResultMode::Dry,
            applied: vec![AppliedEntry {
                path: "a.txt".to_string(),
                was_created: true,
                previous_content: None,
            }],
            commit_sha: None,
            rollback_metadata: Some(RollbackMetadata {
                previous_contents: BTreeMap::from([("a.txt".to_string(), None)]),
            }),
            errors: Vec::new(),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "ok": true,
                "mode": "dry",
                "applied": [{"path": "a.txt", "wasCreated": true, "previousContent": null}],
                "rollbackMetadata": {"previousContents": {"a.txt": null}}
            })
        );
    }
}
