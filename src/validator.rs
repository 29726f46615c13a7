//! Patch-set validation in a sandbox.

use crate::patch::{PatchSet, PatchValidationError};
use crate::sandbox::{CommandLine, SandboxCommand, SandboxOptions, SandboxResult, SandboxRunner, Step};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ValidateError {
    #[error("patch set is empty")]
    EmptyPatchSet,

    #[error("invalid patch set: {0}")]
    InvalidPatchSet(#[from] PatchValidationError),
}

/// Per-call knobs for [`Validator::validate`].
#[derive(Debug, Clone, Default)]
pub struct ValidateOptions {
    /// Explicit command list; `None` uses the validator's defaults
    pub commands: Option<Vec<SandboxCommand>>,
    pub sandbox: SandboxOptions,
}

/// Runs typecheck, tests and lint for a patch set without touching the
/// source tree.
#[derive(Debug, Clone)]
pub struct Validator {
    runner: SandboxRunner,
    configured: BTreeMap<Step, CommandLine>,
}

impl Validator {
    pub fn new(runner: SandboxRunner) -> Self {
        Self {
            runner,
            configured: BTreeMap::new(),
        }
    }

    /// Use `command` for `step` instead of probing.
    pub fn with_command(mut self, step: Step, command: CommandLine) -> Self {
        self.configured.insert(step, command);
        self
    }

    pub fn with_commands(mut self, commands: impl IntoIterator<Item = (Step, CommandLine)>) -> Self {
        self.configured.extend(commands);
        self
    }

    /// One entry per step in fixed order, configured or probed.
    pub fn default_commands(&self) -> Vec<SandboxCommand> {
        Step::ALL
            .into_iter()
            .map(|step| match self.configured.get(&step) {
                Some(command) => SandboxCommand::explicit(step, command.clone()),
                None => SandboxCommand::probe(step),
            })
            .collect()
    }

    /// Validate `patches` in a fresh sandbox.
    ///
    /// Structural problems are rejected before a sandbox is created.
    /// Everything after that is reported inside the [`SandboxResult`].
    pub async fn validate(
        &self,
        patches: &PatchSet,
        options: ValidateOptions,
    ) -> Result<SandboxResult, ValidateError> {
        if patches.is_empty() {
            return Err(ValidateError::EmptyPatchSet);
        }
        patches.validate()?;

        let commands = options
            .commands
            .unwrap_or_else(|| self.default_commands());
        tracing::info!(
            patches = patches.len(),
            steps = commands.len(),
            "validating patch set"
        );
        let result = self.runner.run(patches, &commands, &options.sandbox).await;
        tracing::info!(ok = result.ok, "validation finished");
        Ok(result)
    }
}
