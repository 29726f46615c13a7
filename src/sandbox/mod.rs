//! Isolated validation runs.
//!
//! A [`SandboxRunner`] copies the source tree into a fresh temporary
//! directory, applies a patch set there, and runs validation commands with
//! the sandbox as working directory. The source tree is only ever read.

pub mod copy;
pub mod exec;
pub mod probe;

pub use copy::{fingerprint_tree, CopyStats, TreeCopier, WalkdirCopier};
pub use exec::{CommandExecutor, CommandLine, CommandResult, ExecLimits, OutputBuffer, TokioExecutor};
pub use probe::probe_step;

use crate::apply::{plan_patch_set, write_plan};
use crate::patch::PatchSet;
use crate::safety::{PathGuard, SafetyError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// A named validation phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Typecheck,
    Tests,
    Lint,
}

impl Step {
    pub const ALL: [Step; 3] = [Step::Typecheck, Step::Tests, Step::Lint];

    pub fn as_str(self) -> &'static str {
        match self {
            Step::Typecheck => "typecheck",
            Step::Tests => "tests",
            Step::Lint => "lint",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step plus the command to run for it. `None` probes the sandbox tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxCommand {
    pub step: Step,
    pub command: Option<CommandLine>,
}

impl SandboxCommand {
    pub fn explicit(step: Step, command: CommandLine) -> Self {
        Self {
            step,
            command: Some(command),
        }
    }

    pub fn probe(step: Step) -> Self {
        Self {
            step,
            command: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxOptions {
    pub timeout: Duration,
    pub max_output_bytes: usize,
    pub kill_grace: Duration,
    /// Leave the sandbox directory on disk and report its path
    pub keep_temp: bool,
    /// Tree-relative prefixes not copied into the sandbox
    pub exclude: Vec<String>,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        let limits = ExecLimits::default();
        Self {
            timeout: limits.timeout,
            max_output_bytes: limits.max_output_bytes,
            kill_grace: limits.kill_grace,
            keep_temp: false,
            exclude: Vec::new(),
        }
    }
}

impl SandboxOptions {
    pub fn limits(&self) -> ExecLimits {
        ExecLimits {
            timeout: self.timeout,
            max_output_bytes: self.max_output_bytes,
            kill_grace: self.kill_grace,
        }
    }
}

/// Outcome of a sandbox run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[must_use]
pub struct SandboxResult {
    /// True iff no setup error occurred and every executed command succeeded
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typecheck: Option<CommandResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<CommandResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lint: Option<CommandResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set only when the sandbox was kept
    pub temp_dir: Option<PathBuf>,
    pub logs: String,
}

impl SandboxResult {
    pub fn step(&self, step: Step) -> Option<&CommandResult> {
        match step {
            Step::Typecheck => self.typecheck.as_ref(),
            Step::Tests => self.tests.as_ref(),
            Step::Lint => self.lint.as_ref(),
        }
    }

    fn slot(&mut self, step: Step) -> &mut Option<CommandResult> {
        match step {
            Step::Typecheck => &mut self.typecheck,
            Step::Tests => &mut self.tests,
            Step::Lint => &mut self.lint,
        }
    }
}

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("failed to create sandbox directory: {0}")]
    TempDir(#[source] std::io::Error),

    #[error("failed to copy {path}: {source}")]
    Copy {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to walk source tree: {0}")]
    Walk(#[from] walkdir::Error),

    #[error(transparent)]
    Path(#[from] SafetyError),

    #[error("patch set failed in sandbox: {}", .0.join("; "))]
    Apply(Vec<String>),

    #[error("sandbox setup task failed: {0}")]
    Join(String),
}

/// Line-per-event log carried back in [`SandboxResult::logs`].
#[derive(Debug, Default)]
struct RunLog {
    started: Option<Instant>,
    lines: Vec<String>,
}

impl RunLog {
    fn new() -> Self {
        Self {
            started: Some(Instant::now()),
            lines: Vec::new(),
        }
    }

    fn event(&mut self, message: impl Into<String>) {
        let message = message.into();
        let elapsed = self.started.map(|s| s.elapsed().as_millis()).unwrap_or(0);
        tracing::debug!(target: "repowriter::sandbox", elapsed_ms = elapsed as u64, "{message}");
        self.lines.push(format!("[{elapsed:>6}ms] {message}"));
    }

    fn finish(self) -> String {
        self.lines.join("\n")
    }
}

/// Runs patch sets against a throwaway copy of a source tree.
#[derive(Clone)]
pub struct SandboxRunner {
    source: PathGuard,
    copier: Arc<dyn TreeCopier>,
    executor: Arc<dyn CommandExecutor>,
}

impl SandboxRunner {
    /// `source` is the tree to copy; its forbidden prefixes also apply in the sandbox.
    pub fn new(source: PathGuard) -> Self {
        Self {
            source,
            copier: Arc::new(WalkdirCopier),
            executor: Arc::new(TokioExecutor),
        }
    }

    pub fn with_copier(mut self, copier: Arc<dyn TreeCopier>) -> Self {
        self.copier = copier;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn source_root(&self) -> &Path {
        self.source.root()
    }

    /// Copy, patch and validate in a fresh sandbox.
    ///
    /// Commands run sequentially in the given order. A command that cannot
    /// be resolved (no explicit command and nothing probed) is skipped and
    /// does not affect `ok`. Setup failures are reported in `error` and no
    /// command runs.
    pub async fn run(
        &self,
        patches: &PatchSet,
        commands: &[SandboxCommand],
        options: &SandboxOptions,
    ) -> SandboxResult {
        let mut log = RunLog::new();
        let mut result = SandboxResult::default();

        let temp = match tempfile::Builder::new()
            .prefix("repowriter-sandbox-")
            .tempdir()
        {
            Ok(temp) => temp,
            Err(e) => {
                let err = SandboxError::TempDir(e);
                log.event(format!("setup failed: {err}"));
                result.error = Some(err.to_string());
                result.logs = log.finish();
                return result;
            }
        };
        let sandbox_root = temp.path().to_path_buf();
        log.event(format!("sandbox created at {}", sandbox_root.display()));

        match self.prepare(patches, &sandbox_root, options).await {
            Ok(stats) => {
                log.event(format!(
                    "copied {} files ({} bytes), {} dirs, {} symlinks",
                    stats.files, stats.bytes, stats.dirs, stats.symlinks
                ));
                log.event(format!("applied {} patch(es)", patches.len()));
                let ok = self
                    .run_commands(commands, &sandbox_root, options, &mut result, &mut log)
                    .await;
                result.ok = ok;
            }
            Err(e) => {
                log.event(format!("setup failed: {e}"));
                result.error = Some(e.to_string());
                result.ok = false;
            }
        }

        if options.keep_temp {
            let kept = temp.keep();
            log.event(format!("kept sandbox at {}", kept.display()));
            result.temp_dir = Some(kept);
        } else {
            if let Err(e) = temp.close() {
                tracing::warn!(path = %sandbox_root.display(), error = %e, "failed to remove sandbox");
            }
            log.event("sandbox removed");
        }

        result.logs = log.finish();
        result
    }

    async fn prepare(
        &self,
        patches: &PatchSet,
        sandbox_root: &Path,
        options: &SandboxOptions,
    ) -> Result<CopyStats, SandboxError> {
        let source_root = self.source.root().to_path_buf();
        let guard = self.source.rebased(sandbox_root)?;
        let dest = sandbox_root.to_path_buf();
        let copier = Arc::clone(&self.copier);
        let exclude = options.exclude.clone();
        let patches = patches.clone();

        tokio::task::spawn_blocking(move || -> Result<CopyStats, SandboxError> {
            let stats = copier.copy_tree(&source_root, &dest, &exclude)?;
            let plan = plan_patch_set(&guard, &patches).map_err(|failures| {
                SandboxError::Apply(
                    failures
                        .into_iter()
                        .map(|(path, err)| format!("{path}: {err}"))
                        .collect(),
                )
            })?;
            write_plan(&plan)
                .map_err(|(path, err)| SandboxError::Apply(vec![format!("{path}: {err}")]))?;
            Ok(stats)
        })
        .await
        .map_err(|e| SandboxError::Join(e.to_string()))?
    }

    async fn run_commands(
        &self,
        commands: &[SandboxCommand],
        sandbox_root: &Path,
        options: &SandboxOptions,
        result: &mut SandboxResult,
        log: &mut RunLog,
    ) -> bool {
        let limits = options.limits();
        let mut all_ok = true;

        for entry in commands {
            let command = match &entry.command {
                Some(command) => command.clone(),
                None => match probe_step(sandbox_root, entry.step) {
                    Some(command) => command,
                    None => {
                        log.event(format!("{}: no command found, skipped", entry.step));
                        continue;
                    }
                },
            };

            log.event(format!("{}: running `{command}`", entry.step));
            let outcome = self.executor.execute(&command, sandbox_root, &limits).await;
            log.event(format!(
                "{}: {} (exit {}{})",
                entry.step,
                if outcome.ok { "passed" } else { "failed" },
                outcome
                    .exit_code
                    .map_or_else(|| "none".to_string(), |c| c.to_string()),
                if outcome.timed_out { ", timed out" } else { "" }
            ));

            all_ok &= outcome.ok;
            *result.slot(entry.step) = Some(outcome);
        }

        all_ok
    }
}

impl fmt::Debug for SandboxRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxRunner")
            .field("source", &self.source.root())
            .finish_non_exhaustive()
    }
}
