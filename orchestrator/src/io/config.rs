//! Orchestrator configuration stored under `<data-dir>/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::FailurePolicy;

/// Orchestrator configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to values that work
/// for a single developer machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum number of tasks of one wave dispatched at the same time.
    pub max_concurrency: usize,

    /// What happens to the rest of a run after a task fails.
    pub failure_policy: FailurePolicy,

    /// Prefix for working branches (e.g. `mason/add-retries`).
    pub branch_prefix: String,

    /// Prefix for per-invocation backup branches.
    pub backup_prefix: String,

    pub executor: ExecutorConfig,
}

/// Which task executor implementation to construct.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Spawn `executor.command` once per task.
    #[default]
    Command,
    /// Succeed deterministically without touching the repository.
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    pub kind: ExecutorKind,

    /// Argv of the agent command; the rendered task prompt is written to stdin.
    pub command: Vec<String>,

    /// Per-task wall-clock limit. Absent means wait until the command exits.
    pub timeout_secs: Option<u64>,

    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::Command,
            command: vec!["claude".to_string(), "-p".to_string()],
            timeout_secs: None,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            failure_policy: FailurePolicy::Stop,
            branch_prefix: "mason/".to_string(),
            backup_prefix: "mason-backup/".to_string(),
            executor: ExecutorConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(anyhow!("max_concurrency must be > 0"));
        }
        validate_prefix("branch_prefix", &self.branch_prefix)?;
        validate_prefix("backup_prefix", &self.backup_prefix)?;
        if self.branch_prefix == self.backup_prefix {
            return Err(anyhow!("branch_prefix and backup_prefix must differ"));
        }
        if self.executor.output_limit_bytes == 0 {
            return Err(anyhow!("executor.output_limit_bytes must be > 0"));
        }
        if self.executor.timeout_secs == Some(0) {
            return Err(anyhow!("executor.timeout_secs must be > 0 when set"));
        }
        if self.executor.kind == ExecutorKind::Command
            && (self.executor.command.is_empty() || self.executor.command[0].trim().is_empty())
        {
            return Err(anyhow!("executor.command must be a non-empty array"));
        }
        Ok(())
    }
}

fn validate_prefix(field: &str, prefix: &str) -> Result<()> {
    if prefix.trim().is_empty() {
        return Err(anyhow!("{field} must not be empty"));
    }
    if prefix
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c))
        || prefix.contains("..")
        || prefix.starts_with('/')
        || prefix.starts_with('-')
    {
        return Err(anyhow!("{field} '{prefix}' is not a valid git ref prefix"));
    }
    Ok(())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        let cfg = OrchestratorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
