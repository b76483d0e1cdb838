//! Task executor abstraction.
//!
//! The [`TaskExecutor`] trait decouples wave dispatch from whatever actually
//! performs a task. The default backend spawns a configured agent command once
//! per task; tests use scripted executors that never spawn processes.
//!
//! Executors are called concurrently from worker threads and must not touch the
//! store; the driver records every result.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::types::SubagentType;
use crate::io::config::{ExecutorConfig, ExecutorKind};
use crate::io::process::run_command;
use crate::io::prompt::PromptEngine;

/// Everything an executor needs to perform one task.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub run_id: String,
    pub task_id: String,
    pub wave: u32,
    pub task_number: u32,
    pub total_waves: u32,
    pub subagent_type: SubagentType,
    pub description: String,
    pub item_title: String,
    pub item_problem: String,
    pub item_solution: String,
    /// Repository working tree the task operates on.
    pub repo: PathBuf,
    /// Working branch checked out for the run.
    pub branch: String,
}

/// A task the executor could not complete. The message is stored on the task row.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TaskError {
    pub message: String,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

/// Performs a single task.
///
/// `Ok` carries the task output recorded on the task row.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, request: &TaskRequest) -> Result<String, TaskError>;
}

impl<T: TaskExecutor + ?Sized> TaskExecutor for Box<T> {
    fn execute(&self, request: &TaskRequest) -> Result<String, TaskError> {
        (**self).execute(request)
    }
}

/// Build the executor selected by `[executor]` in the config.
pub fn build_executor(cfg: &ExecutorConfig) -> Result<Box<dyn TaskExecutor>> {
    match cfg.kind {
        ExecutorKind::Command => Ok(Box::new(CommandExecutor::new(cfg)?)),
        ExecutorKind::Simulated => Ok(Box::new(SimulatedExecutor)),
    }
}

/// Spawns the configured agent command once per task.
///
/// The rendered prompt goes to stdin; task metadata is exported as `MASON_*`
/// environment variables. The child runs in the repository root.
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
    output_limit_bytes: usize,
    prompts: PromptEngine,
}

impl CommandExecutor {
    pub fn new(cfg: &ExecutorConfig) -> Result<Self> {
        let (program, args) = cfg
            .command
            .split_first()
            .ok_or_else(|| anyhow!("executor.command must be a non-empty array"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout: cfg.timeout_secs.map(Duration::from_secs),
            output_limit_bytes: cfg.output_limit_bytes,
            prompts: PromptEngine::new()?,
        })
    }

    fn command(&self, request: &TaskRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&request.repo)
            .env("MASON_RUN_ID", &request.run_id)
            .env("MASON_TASK_ID", &request.task_id)
            .env("MASON_WAVE", request.wave.to_string())
            .env("MASON_TOTAL_WAVES", request.total_waves.to_string())
            .env("MASON_TASK_NUMBER", request.task_number.to_string())
            .env("MASON_SUBAGENT_TYPE", request.subagent_type.as_str())
            .env("MASON_BRANCH", &request.branch);
        cmd
    }
}

impl TaskExecutor for CommandExecutor {
    fn execute(&self, request: &TaskRequest) -> Result<String, TaskError> {
        self.run(request).map_err(TaskError::from)
    }
}

impl CommandExecutor {
    #[instrument(skip_all, fields(task_id = %request.task_id, wave = request.wave, task_number = request.task_number))]
    fn run(&self, request: &TaskRequest) -> Result<String> {
        let prompt = self.prompts.render_task(request)?;
        info!(program = %self.program, subagent = %request.subagent_type, "starting task command");

        let output = run_command(
            self.command(request),
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run executor command '{}'", self.program))?;

        if output.timed_out {
            warn!("task command timed out");
            bail!(
                "executor command timed out after {}s",
                self.timeout.map(|t| t.as_secs()).unwrap_or_default()
            );
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "task command failed");
            let stderr = output.stderr_text();
            let stderr = stderr.trim();
            if stderr.is_empty() {
                bail!("executor command exited with status {:?}", output.status.code());
            }
            bail!(
                "executor command exited with status {:?}: {stderr}",
                output.status.code()
            );
        }

        debug!("task command completed");
        Ok(output.stdout_text().trim().to_string())
    }
}

/// Completes every task immediately without touching the repository.
///
/// Useful for rehearsing a batch end to end: branches, commits, and store rows
/// are all produced, but no agent runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatedExecutor;

impl TaskExecutor for SimulatedExecutor {
    fn execute(&self, request: &TaskRequest) -> Result<String, TaskError> {
        debug!(task_id = %request.task_id, "simulating task");
        Ok(format!(
            "simulated {} task {}.{}: {}",
            request.subagent_type, request.wave, request.task_number, request.description
        ))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn request(repo: PathBuf) -> TaskRequest {
        TaskRequest {
            run_id: "run-1".to_string(),
            task_id: "task-1".to_string(),
            wave: 1,
            task_number: 2,
            total_waves: 3,
            subagent_type: SubagentType::Explore,
            description: "Look around".to_string(),
            item_title: "Item".to_string(),
            item_problem: String::new(),
            item_solution: String::new(),
            repo,
            branch: "mason/item".to_string(),
        }
    }

    fn sh(script: &str) -> ExecutorConfig {
        ExecutorConfig {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            ..ExecutorConfig::default()
        }
    }

    #[test]
    fn command_executor_exports_task_env() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exec = CommandExecutor::new(&sh(
            "cat >/dev/null; echo \"$MASON_SUBAGENT_TYPE $MASON_WAVE.$MASON_TASK_NUMBER $MASON_BRANCH\"",
        ))
        .expect("executor");
        let out = exec.execute(&request(temp.path().to_path_buf())).expect("run");
        assert_eq!(out, "explore 1.2 mason/item");
    }

    #[test]
    fn command_executor_feeds_prompt_on_stdin() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exec = CommandExecutor::new(&sh("grep -c 'Look around'")).expect("executor");
        let out = exec.execute(&request(temp.path().to_path_buf())).expect("run");
        assert_eq!(out, "1");
    }

    #[test]
    fn nonzero_exit_is_a_task_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exec = CommandExecutor::new(&sh("echo nope >&2; exit 3")).expect("executor");
        let err = exec
            .execute(&request(temp.path().to_path_buf()))
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Some(3)"));
        assert!(msg.contains("nope"));
    }

    #[test]
    fn timeout_is_a_task_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = ExecutorConfig {
            timeout_secs: Some(1),
            ..sh("exec sleep 10")
        };
        let exec = CommandExecutor::new(&cfg).expect("executor");
        let err = exec
            .execute(&request(temp.path().to_path_buf()))
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn simulated_executor_always_succeeds() {
        let out = SimulatedExecutor
            .execute(&request(PathBuf::from("/nowhere")))
            .expect("run");
        assert!(out.starts_with("simulated explore task 1.2"));
    }
}
