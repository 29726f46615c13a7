//! Default validation commands inferred from project markers.

use super::exec::CommandLine;
use super::Step;
use std::path::Path;

/// npm's placeholder test script; running it always fails.
const NPM_PLACEHOLDER_TEST: &str = "no test specified";

/// Pick a command for `step` by looking at marker files in `root`.
///
/// Returns `None` when the tree gives no hint; the step is then skipped.
pub fn probe_step(root: &Path, step: Step) -> Option<CommandLine> {
    let scripts = package_scripts(root);
    let has_script = |name: &str| {
        scripts
            .as_ref()
            .and_then(|s| s.get(name))
            .and_then(serde_json::Value::as_str)
            .is_some_and(|script| !script.contains(NPM_PLACEHOLDER_TEST))
    };
    let cargo = root.join("Cargo.toml").is_file();

    match step {
        Step::Typecheck if root.join("tsconfig.json").is_file() => {
            Some(CommandLine::new("npx", ["tsc", "--noEmit"]))
        }
        Step::Typecheck if cargo => Some(CommandLine::new("cargo", ["check", "--quiet"])),
        Step::Tests if has_script("test") => Some(CommandLine::new("npm", ["test", "--silent"])),
        Step::Tests if cargo => Some(CommandLine::new("cargo", ["test", "--quiet"])),
        Step::Lint if has_script("lint") => {
            Some(CommandLine::new("npm", ["run", "lint", "--silent"]))
        }
        Step::Lint if cargo => Some(CommandLine::new("cargo", ["clippy", "--quiet"])),
        _ => None,
    }
}

fn package_scripts(root: &Path) -> Option<serde_json::Map<String, serde_json::Value>> {
    let path = root.join("package.json");
    let text = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(serde_json::Value::Object(mut manifest)) => match manifest.remove("scripts") {
            Some(serde_json::Value::Object(scripts)) => Some(scripts),
            _ => None,
        },
        Ok(_) => None,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "unreadable package.json");
            None
        }
    }
}
