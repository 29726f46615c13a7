use crate::sandbox::{CommandLine, SandboxOptions, Step};
use crate::vcs::Author;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Contents of `repowriter.toml`.
#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct RepoConfig {
    #[serde(default)]
    pub repo: RepoSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RepoSection {
    /// Working tree root; relative paths resolve against the current directory
    pub root: Option<PathBuf>,
    pub author_name: String,
    pub author_email: String,
    /// Tree-relative prefixes that patches may never touch
    pub forbidden: Vec<String>,
}

impl Default for RepoSection {
    fn default() -> Self {
        let author = Author::default();
        Self {
            root: None,
            author_name: author.name,
            author_email: author.email,
            forbidden: vec![".git".to_string()],
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxSection {
    pub timeout_ms: u64,
    pub max_output_bytes: usize,
    pub keep_temp: bool,
    pub kill_grace_ms: u64,
    /// Tree-relative prefixes not copied into the sandbox
    pub exclude: Vec<String>,
    pub commands: CommandsSection,
}

impl Default for SandboxSection {
    fn default() -> Self {
        let defaults = SandboxOptions::default();
        Self {
            timeout_ms: defaults.timeout.as_millis() as u64,
            max_output_bytes: defaults.max_output_bytes,
            keep_temp: defaults.keep_temp,
            kill_grace_ms: defaults.kill_grace.as_millis() as u64,
            exclude: defaults.exclude,
            commands: CommandsSection::default(),
        }
    }
}

/// Explicit argv per validation step. Unset steps are probed.
#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct CommandsSection {
    pub typecheck: Option<Vec<String>>,
    pub tests: Option<Vec<String>>,
    pub lint: Option<Vec<String>>,
}

impl CommandsSection {
    pub fn get(&self, step: Step) -> Option<&[String]> {
        match step {
            Step::Typecheck => self.typecheck.as_deref(),
            Step::Tests => self.tests.as_deref(),
            Step::Lint => self.lint.as_deref(),
        }
    }

    /// Configured commands in step order. Call after [`RepoConfig::validate`].
    pub fn configured(&self) -> Vec<(Step, CommandLine)> {
        Step::ALL
            .into_iter()
            .filter_map(|step| {
                let argv = self.get(step)?.to_vec();
                CommandLine::try_from(argv).ok().map(|cmd| (step, cmd))
            })
            .collect()
    }
}

impl RepoConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut issues = Vec::new();

        if self.repo.author_name.trim().is_empty() {
            issues.push(ValidationIssue::EmptyField {
                field: "repo.author_name",
            });
        }
        if self.repo.author_email.trim().is_empty() {
            issues.push(ValidationIssue::EmptyField {
                field: "repo.author_email",
            });
        }
        if self.sandbox.timeout_ms == 0 {
            issues.push(ValidationIssue::NotPositive {
                field: "sandbox.timeout_ms",
            });
        }
        if self.sandbox.max_output_bytes == 0 {
            issues.push(ValidationIssue::NotPositive {
                field: "sandbox.max_output_bytes",
            });
        }
        for step in Step::ALL {
            if let Some(argv) = self.sandbox.commands.get(step) {
                if argv.first().map_or(true, |program| program.trim().is_empty()) {
                    issues.push(ValidationIssue::EmptyCommand { step });
                }
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { issues })
        }
    }

    pub fn author(&self) -> Author {
        Author::new(&self.repo.author_name, &self.repo.author_email)
    }

    pub fn sandbox_options(&self) -> SandboxOptions {
        SandboxOptions {
            timeout: Duration::from_millis(self.sandbox.timeout_ms),
            max_output_bytes: self.sandbox.max_output_bytes,
            kill_grace: Duration::from_millis(self.sandbox.kill_grace_ms),
            keep_temp: self.sandbox.keep_temp,
            exclude: self.sandbox.exclude.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, issue) in self.issues.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    EmptyField { field: &'static str },
    NotPositive { field: &'static str },
    EmptyCommand { step: Step },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::EmptyField { field } => write!(f, "'{field}' must not be empty"),
            ValidationIssue::NotPositive { field } => write!(f, "'{field}' must be greater than 0"),
            ValidationIssue::EmptyCommand { step } => {
                write!(f, "'sandbox.commands.{step}' must name a program")
            }
        }
    }
}
