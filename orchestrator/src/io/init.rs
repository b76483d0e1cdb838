//! Data directory layout and initialization.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

/// Default data directory name under the repository root.
pub const DEFAULT_DATA_DIR: &str = ".mason";

const GITIGNORE_CONTENTS: &str = "*\n";

/// All canonical paths used by one invocation.
#[derive(Debug, Clone)]
pub struct MasonPaths {
    pub repo: PathBuf,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub lock_path: PathBuf,
    pub config_path: PathBuf,
    pub gitignore_path: PathBuf,
}

impl MasonPaths {
    /// Paths for `repo`, with the data directory defaulting to `<repo>/.mason`.
    pub fn new(repo: impl Into<PathBuf>, data_dir: Option<PathBuf>) -> Self {
        let repo = repo.into();
        let data_dir = data_dir.unwrap_or_else(|| repo.join(DEFAULT_DATA_DIR));
        Self {
            repo,
            db_path: data_dir.join("mason.db"),
            lock_path: data_dir.join("execute.lock"),
            config_path: data_dir.join("config.toml"),
            gitignore_path: data_dir.join(".gitignore"),
            data_dir,
        }
    }
}

/// Create the data directory and make git ignore everything inside it.
///
/// Idempotent; an existing `.gitignore` is left alone.
pub fn ensure_data_dir(paths: &MasonPaths) -> Result<()> {
    fs::create_dir_all(&paths.data_dir)
        .with_context(|| format!("create data directory {}", paths.data_dir.display()))?;
    write_if_missing(&paths.gitignore_path, GITIGNORE_CONTENTS)?;
    Ok(())
}

fn write_if_missing(path: &Path, contents: &str) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    debug!(path = %path.display(), "writing data directory file");
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}
