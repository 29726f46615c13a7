use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use repowriter::config::{self, RepoConfig};
use repowriter::{
    ApplyEngine, ApplyMode, ApplyResult, PatchRequest, PatchSet, RepoHandle, RequestMode, ResultMode,
    RollbackManager, RollbackOutcome, RollbackRequest, SandboxResult, SandboxRunner, Step,
    ValidateOptions, Validator,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "REPOWRITER_LOG";

#[derive(Parser)]
#[command(name = "repowriter")]
#[command(about = "Apply, validate and roll back patch sets against a working tree", long_about = None)]
#[command(version)]
struct Cli {
    /// Working tree root (falls back to REPOWRITER_ROOT, config, then cwd)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Config file (defaults to ./repowriter.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run typecheck, tests and lint for a patch set in a sandbox
    Validate {
        /// JSON payload file (stdin if omitted or "-")
        payload: Option<PathBuf>,

        /// Keep the sandbox directory for inspection
        #[arg(long)]
        keep_temp: bool,

        /// Per-command timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Apply a patch set to the working tree and commit it
    Apply {
        /// JSON payload file (stdin if omitted or "-")
        payload: Option<PathBuf>,

        /// Dry run - report what would change without writing
        #[arg(short = 'n', long)]
        dry_run: bool,

        /// Show unified diff of changes on stderr
        #[arg(short, long)]
        diff: bool,
    },

    /// Dispatch on the payload's own "mode" (dry, apply or validate)
    Run {
        /// JSON payload file (stdin if omitted or "-")
        payload: Option<PathBuf>,
    },

    /// Undo a commit ({"commitSha"}) or replay captured contents
    Rollback {
        /// JSON payload file (stdin if omitted or "-")
        payload: Option<PathBuf>,
    },

    /// Print the unified diff a patch set would produce
    Diff {
        /// JSON payload file (stdin if omitted or "-")
        payload: Option<PathBuf>,
    },
}

/// A patch request, or a bare patch array.
#[derive(Deserialize)]
#[serde(untagged)]
enum PatchPayload {
    Request(PatchRequest),
    Bare(PatchSet),
}

impl PatchPayload {
    fn into_request(self) -> PatchRequest {
        match self {
            PatchPayload::Request(request) => request,
            PatchPayload::Bare(patches) => PatchRequest {
                patches,
                mode: RequestMode::default(),
            },
        }
    }
}

struct Context {
    config: RepoConfig,
    repo: RepoHandle,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let ctx = load_context(&cli)?;
    let ok = match cli.command {
        Commands::Validate {
            payload,
            keep_temp,
            timeout_ms,
        } => {
            let request = read_patch_request(payload.as_deref())?;
            cmd_validate(&ctx, &request.patches, keep_temp, timeout_ms).await?
        }

        Commands::Apply {
            payload,
            dry_run,
            diff,
        } => {
            let request = read_patch_request(payload.as_deref())?;
            let mode = if dry_run {
                ApplyMode::Dry
            } else {
                ApplyMode::Apply
            };
            cmd_apply(&ctx, &request.patches, mode, diff)?
        }

        Commands::Run { payload } => {
            let request = read_patch_request(payload.as_deref())?;
            match request.mode {
                RequestMode::Validate => cmd_validate(&ctx, &request.patches, false, None).await?,
                RequestMode::Dry => cmd_apply(&ctx, &request.patches, ApplyMode::Dry, false)?,
                RequestMode::Apply => cmd_apply(&ctx, &request.patches, ApplyMode::Apply, false)?,
            }
        }

        Commands::Rollback { payload } => {
            let request: RollbackRequest = read_payload(payload.as_deref())?;
            cmd_rollback(&ctx, &request)?
        }

        Commands::Diff { payload } => {
            let request = read_patch_request(payload.as_deref())?;
            cmd_diff(&ctx, &request.patches)?
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn load_context(cli: &Cli) -> Result<Context> {
    let cwd = env::current_dir().context("cannot determine current directory")?;
    let mut config = config::discover(cli.config.as_deref(), &cwd)?;
    config::apply_env_overrides(&mut config);

    let root = config::resolve_root(cli.root.as_deref(), &config)?;
    tracing::debug!(root = %root.display(), "resolved working tree");
    let repo = RepoHandle::git(&root, config.author())?.with_forbidden(&config.repo.forbidden);
    Ok(Context { config, repo })
}

fn read_input(source: Option<&Path>) -> Result<String> {
    match source {
        Some(path) if path != Path::new("-") => fs::read_to_string(path)
            .with_context(|| format!("failed to read payload from {}", path.display())),
        _ => {
            let mut input = String::new();
            io::stdin()
                .read_to_string(&mut input)
                .context("failed to read payload from stdin")?;
            Ok(input)
        }
    }
}

fn read_payload<T: for<'de> Deserialize<'de>>(source: Option<&Path>) -> Result<T> {
    let input = read_input(source)?;
    serde_json::from_str(&input).context("invalid JSON payload")
}

fn read_patch_request(source: Option<&Path>) -> Result<PatchRequest> {
    read_payload::<PatchPayload>(source).map(PatchPayload::into_request)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}

async fn cmd_validate(
    ctx: &Context,
    patches: &PatchSet,
    keep_temp: bool,
    timeout_ms: Option<u64>,
) -> Result<bool> {
    let mut sandbox = ctx.config.sandbox_options();
    sandbox.keep_temp |= keep_temp;
    if let Some(ms) = timeout_ms {
        sandbox.timeout = std::time::Duration::from_millis(ms);
    }

    let validator = Validator::new(SandboxRunner::new(ctx.repo.guard().clone()))
        .with_commands(ctx.config.sandbox.commands.configured());
    let result = validator
        .validate(
            patches,
            ValidateOptions {
                commands: None,
                sandbox,
            },
        )
        .await?;

    print_json(&result)?;
    summarize_sandbox(&result);
    Ok(result.ok)
}

fn cmd_apply(ctx: &Context, patches: &PatchSet, mode: ApplyMode, show_diff: bool) -> Result<bool> {
    let engine = ApplyEngine::new(ctx.repo.clone());

    if show_diff {
        // Preview from a dry plan; a failing set has nothing to show.
        if let Ok(plan) = engine.plan(patches) {
            for change in plan.changes() {
                display_diff(&mut io::stderr(), &change.preview());
            }
        }
    }

    let result = engine.apply(patches, mode);
    print_json(&result)?;
    summarize_apply(&result);
    Ok(result.ok)
}

fn cmd_rollback(ctx: &Context, request: &RollbackRequest) -> Result<bool> {
    let manager = RollbackManager::new(ctx.repo.clone());
    match manager.handle(request) {
        Ok(outcome) => {
            print_json(&outcome)?;
            summarize_rollback(&outcome);
            Ok(true)
        }
        Err(e) => {
            print_json(&serde_json::json!({ "ok": false, "error": e.to_string() }))?;
            eprintln!("{} Rollback failed: {}", "✗".red(), e);
            Ok(false)
        }
    }
}

fn cmd_diff(ctx: &Context, patches: &PatchSet) -> Result<bool> {
    let engine = ApplyEngine::new(ctx.repo.clone());
    match engine.plan(patches) {
        Ok(plan) => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            for change in plan.changes() {
                display_diff(&mut out, &change.preview());
            }
            Ok(true)
        }
        Err(failures) => {
            for (path, error) in failures {
                if path.is_empty() {
                    eprintln!("{} {}", "✗".red(), error);
                } else {
                    eprintln!("{} {}: {}", "✗".red(), path, error);
                }
            }
            Ok(false)
        }
    }
}

/// Helper: colorize a unified diff line by line
fn display_diff(out: &mut dyn Write, diff: &str) {
    for line in diff.lines() {
        let styled = if line.starts_with("+++") || line.starts_with("---") {
            line.dimmed()
        } else if line.starts_with("@@") {
            line.cyan()
        } else if line.starts_with('+') {
            line.green()
        } else if line.starts_with('-') {
            line.red()
        } else {
            line.normal()
        };
        // Broken pipe on a preview is not worth failing the command.
        let _ = writeln!(out, "{styled}");
    }
}

fn summarize_sandbox(result: &SandboxResult) {
    for step in Step::ALL {
        match result.step(step) {
            Some(outcome) if outcome.ok => eprintln!("{} {}: passed", "✓".green(), step),
            Some(outcome) if outcome.timed_out => {
                eprintln!("{} {}: timed out", "⊙".yellow(), step)
            }
            Some(outcome) => eprintln!(
                "{} {}: failed (exit {})",
                "✗".red(),
                step,
                outcome
                    .exit_code
                    .map_or_else(|| "none".to_string(), |c| c.to_string())
            ),
            None => eprintln!("{} {}: skipped", "⊘".cyan(), step),
        }
    }
    if let Some(error) = &result.error {
        eprintln!("{} {}", "✗".red(), error);
    }
    if let Some(dir) = &result.temp_dir {
        eprintln!("{}", format!("Sandbox kept at {}", dir.display()).dimmed());
    }
    let verdict = if result.ok {
        "PASSED".green().bold()
    } else {
        "FAILED".red().bold()
    };
    eprintln!("{} {}", "Validation:".bold(), verdict);
}

fn summarize_apply(result: &ApplyResult) {
    for entry in &result.applied {
        let marker = if entry.was_created {
            "+".green()
        } else {
            "~".yellow()
        };
        eprintln!("  {} {}", marker, entry.path);
    }
    for error in &result.errors {
        eprintln!("{} {}", "✗".red(), error);
    }
    match (&result.commit_sha, result.ok) {
        (Some(sha), _) => eprintln!(
            "{} Committed {} file(s) as {}",
            "✓".green(),
            result.applied.len(),
            &sha[..sha.len().min(12)]
        ),
        (None, true) if result.applied.is_empty() => {
            eprintln!("{}", "Nothing to apply".dimmed())
        }
        (None, true) => eprintln!(
            "{}",
            format!("[DRY RUN] {} file(s) would change", result.applied.len()).cyan()
        ),
        // Applied entries without a commit: the write went through, the commit did not
        (None, false) if !result.applied.is_empty() && result.mode == ResultMode::Apply => {
            eprintln!(
                "{}",
                "Files written but not committed; replay rollbackMetadata to undo"
                    .yellow()
                    .bold()
            )
        }
        (None, false) => eprintln!("{}", "Patch set not applied".red().bold()),
    }
}

fn summarize_rollback(outcome: &RollbackOutcome) {
    if let Some(parent) = &outcome.reset_to {
        eprintln!("{} Reset working tree to {}", "✓".green(), parent);
    }
    if let Some(sha) = &outcome.commit_sha {
        eprintln!(
            "{} Restored {} file(s) in commit {}",
            "✓".green(),
            outcome.changed.len(),
            &sha[..sha.len().min(12)]
        );
    }
}
