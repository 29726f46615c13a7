use crate::config::schema::{RepoConfig, ValidationError};
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Config file looked up in the current directory when none is given.
pub const CONFIG_FILE_NAME: &str = "repowriter.toml";
pub const ROOT_ENV: &str = "REPOWRITER_ROOT";
pub const AUTHOR_NAME_ENV: &str = "REPOWRITER_AUTHOR_NAME";
pub const AUTHOR_EMAIL_ENV: &str = "REPOWRITER_AUTHOR_EMAIL";

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Toml {
        path: Option<PathBuf>,
        source: toml_edit::de::Error,
    },
    Validation {
        path: Option<PathBuf>,
        source: ValidationError,
    },
    Root {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl ConfigError {
    fn with_path(self, path: &Path) -> Self {
        let path = path.to_path_buf();
        match self {
            ConfigError::Toml { path: None, source } => ConfigError::Toml {
                path: Some(path),
                source,
            },
            ConfigError::Validation { path: None, source } => ConfigError::Validation {
                path: Some(path),
                source,
            },
            other => other,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "failed to read config from {}: {}", path.display(), source)
            }
            ConfigError::Toml { path, source } => match path {
                Some(path) => write!(
                    f,
                    "failed to parse config TOML ({}): {}",
                    path.display(),
                    source
                ),
                None => write!(f, "failed to parse config TOML: {}", source),
            },
            ConfigError::Validation { path, source } => match path {
                Some(path) => write!(f, "invalid config ({}): {}", path.display(), source),
                None => write!(f, "invalid config: {}", source),
            },
            ConfigError::Root { path, source } => {
                write!(f, "working tree root {} is unusable: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Toml { source, .. } => Some(source),
            ConfigError::Validation { source, .. } => Some(source),
            ConfigError::Root { source, .. } => Some(source),
        }
    }
}

pub fn load_from_str(input: &str) -> Result<RepoConfig, ConfigError> {
    let config: RepoConfig = toml_edit::de::from_str(input)
        .map_err(|source| ConfigError::Toml { path: None, source })?;
    config
        .validate()
        .map_err(|source| ConfigError::Validation { path: None, source })?;
    Ok(config)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<RepoConfig, ConfigError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    load_from_str(&contents).map_err(|error| error.with_path(path))
}

/// Load an explicit config file, or `repowriter.toml` in `cwd` if present,
/// or fall back to defaults.
pub fn discover(explicit: Option<&Path>, cwd: &Path) -> Result<RepoConfig, ConfigError> {
    if let Some(path) = explicit {
        return load_from_path(path);
    }
    let candidate = cwd.join(CONFIG_FILE_NAME);
    if candidate.is_file() {
        tracing::debug!(path = %candidate.display(), "using config file");
        return load_from_path(candidate);
    }
    Ok(RepoConfig::default())
}

/// Override author fields from `REPOWRITER_AUTHOR_NAME` / `REPOWRITER_AUTHOR_EMAIL`.
pub fn apply_env_overrides(config: &mut RepoConfig) {
    override_author(
        config,
        std::env::var(AUTHOR_NAME_ENV).ok(),
        std::env::var(AUTHOR_EMAIL_ENV).ok(),
    );
}

fn override_author(config: &mut RepoConfig, name: Option<String>, email: Option<String>) {
    if let Some(name) = name.filter(|n| !n.trim().is_empty()) {
        config.repo.author_name = name;
    }
    if let Some(email) = email.filter(|e| !e.trim().is_empty()) {
        config.repo.author_email = email;
    }
}

/// Resolve the working tree root.
///
/// Priority order:
/// 1. Explicit flag
/// 2. `REPOWRITER_ROOT`
/// 3. `[repo] root` in config
/// 4. Current directory
pub fn resolve_root(flag: Option<&Path>, config: &RepoConfig) -> Result<PathBuf, ConfigError> {
    let cwd = std::env::current_dir().map_err(|source| ConfigError::Root {
        path: PathBuf::from("."),
        source,
    })?;
    resolve_root_from(flag, std::env::var_os(ROOT_ENV), config, &cwd)
}

fn resolve_root_from(
    flag: Option<&Path>,
    env: Option<OsString>,
    config: &RepoConfig,
    cwd: &Path,
) -> Result<PathBuf, ConfigError> {
    let chosen = flag
        .map(Path::to_path_buf)
        .or_else(|| env.filter(|v| !v.is_empty()).map(PathBuf::from))
        .or_else(|| config.repo.root.clone())
        .unwrap_or_else(|| cwd.to_path_buf());
    let absolute = if chosen.is_absolute() {
        chosen
    } else {
        cwd.join(chosen)
    };
    absolute
        .canonicalize()
        .map_err(|source| ConfigError::Root {
            path: absolute.clone(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ValidationIssue;
    use crate::sandbox::{CommandLine, Step};
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = load_from_str("").unwrap();
        assert_eq!(config, RepoConfig::default());
        assert_eq!(config.repo.forbidden, vec![".git".to_string()]);
        assert_eq!(config.sandbox.timeout_ms, 120_000);
        assert_eq!(config.sandbox.max_output_bytes, 20_000);
        assert!(config.sandbox.commands.configured().is_empty());
    }

    #[test]
    fn test_full_config() {
        let config = load_from_str(
            r#"
[repo]
root = "/srv/tree"
author_name = "Bot"
author_email = "bot@example.com"
forbidden = [".git", "secrets"]

[sandbox]
timeout_ms = 500
keep_temp = true
exclude = ["node_modules", "target"]

[sandbox.commands]
tests = ["npm", "test"]
"#,
        )
        .unwrap();

        assert_eq!(config.repo.root, Some(PathBuf::from("/srv/tree")));
        assert_eq!(config.author().to_string(), "Bot <bot@example.com>");
        let options = config.sandbox_options();
        assert_eq!(options.timeout, Duration::from_millis(500));
        assert_eq!(options.max_output_bytes, 20_000);
        assert!(options.keep_temp);
        assert_eq!(options.exclude, vec!["node_modules", "target"]);
        assert_eq!(
            config.sandbox.commands.configured(),
            vec![(Step::Tests, CommandLine::new("npm", ["test"]))]
        );
    }

    #[test]
    fn test_validation_collects_issues() {
        let err = load_from_str(
            r#"
[repo]
author_name = " "

[sandbox]
timeout_ms = 0

[sandbox.commands]
lint = []
"#,
        )
        .unwrap_err();

        match err {
            ConfigError::Validation { source, .. } => {
                assert_eq!(source.issues.len(), 3);
                assert!(source
                    .issues
                    .contains(&ValidationIssue::EmptyCommand { step: Step::Lint }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_parse_error_carries_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "[repo\n").unwrap();
        let err = load_from_path(&path).unwrap_err();
        assert!(err.to_string().contains(CONFIG_FILE_NAME));
    }

    #[test]
    fn test_discover_prefers_explicit_then_cwd() {
        let dir = TempDir::new().unwrap();
        assert_eq!(discover(None, dir.path()).unwrap(), RepoConfig::default());

        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "[sandbox]\ntimeout_ms = 42\n",
        )
        .unwrap();
        assert_eq!(discover(None, dir.path()).unwrap().sandbox.timeout_ms, 42);

        let other = dir.path().join("other.toml");
        fs::write(&other, "[sandbox]\ntimeout_ms = 7\n").unwrap();
        assert_eq!(
            discover(Some(&other), dir.path()).unwrap().sandbox.timeout_ms,
            7
        );
        assert!(discover(Some(&dir.path().join("missing.toml")), dir.path()).is_err());
    }

    #[test]
    fn test_author_override() {
        let mut config = RepoConfig::default();
        override_author(&mut config, Some("Ada".to_string()), Some(" ".to_string()));
        assert_eq!(config.repo.author_name, "Ada");
        assert_eq!(config.repo.author_email, RepoConfig::default().repo.author_email);
    }

    #[test]
    fn test_root_priority() {
        let flag_dir = TempDir::new().unwrap();
        let env_dir = TempDir::new().unwrap();
        let cfg_dir = TempDir::new().unwrap();
        let cwd = TempDir::new().unwrap();
        let config = RepoConfig {
            repo: crate::config::schema::RepoSection {
                root: Some(cfg_dir.path().to_path_buf()),
                ..Default::default()
            },
            ..Default::default()
        };
        let env = Some(env_dir.path().as_os_str().to_owned());

        let root =
            resolve_root_from(Some(flag_dir.path()), env.clone(), &config, cwd.path()).unwrap();
        assert_eq!(root, flag_dir.path().canonicalize().unwrap());

        let root = resolve_root_from(None, env, &config, cwd.path()).unwrap();
        assert_eq!(root, env_dir.path().canonicalize().unwrap());

        let root = resolve_root_from(None, None, &config, cwd.path()).unwrap();
        assert_eq!(root, cfg_dir.path().canonicalize().unwrap());

        let root = resolve_root_from(None, None, &RepoConfig::default(), cwd.path()).unwrap();
        assert_eq!(root, cwd.path().canonicalize().unwrap());
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let cwd = TempDir::new().unwrap();
        let err = resolve_root_from(
            Some(Path::new("does/not/exist")),
            None,
            &RepoConfig::default(),
            cwd.path(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Root { .. }));
    }
}
