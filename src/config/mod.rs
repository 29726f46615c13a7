pub mod loader;
pub mod schema;

pub use loader::{
    apply_env_overrides, discover, load_from_path, load_from_str, resolve_root, ConfigError,
    AUTHOR_EMAIL_ENV, AUTHOR_NAME_ENV, CONFIG_FILE_NAME, ROOT_ENV,
};
pub use schema::{
    CommandsSection, RepoConfig, RepoSection, SandboxSection, ValidationError, ValidationIssue,
};
