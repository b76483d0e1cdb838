//! Orchestration for `mason execute`.
//!
//! One invocation validates the repository, takes the repository lock, snapshots
//! a backup branch, and then processes each selected item in turn: persist the
//! plan, check out the working branch, run the waves, commit after each wave,
//! and finalize the run. The store is written before every step that depends
//! on it, so an interrupted invocation can be resumed by running it again.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::planner::{generate_waves_for_item, planned_tasks};
use crate::core::reconcile::{any_failed, dispatchable, reconcile};
use crate::core::selection::{Candidate, Selection, select_items};
use crate::core::types::{
    BacklogItem, ExecutionRun, ExecutionTask, FailurePolicy, ItemStatus, RunStatus, TaskStatus,
    Wave,
};
use crate::dispatch::{TaskResult, dispatch_wave};
use crate::io::branches::{Backup, BranchManager};
use crate::io::config::OrchestratorConfig;
use crate::io::executor::{TaskExecutor, TaskRequest};
use crate::io::git::Git;
use crate::io::git_state::{GitStateInvalid, GitStateIssue, validate_git_state};
use crate::io::init::{MasonPaths, ensure_data_dir};
use crate::io::lock::{self, Takeover};
use crate::io::signals;
use crate::io::store::{NewRun, Store};

const LOCK_COMMAND: &str = "mason execute";
const SKIP_REASON: &str = "not started: another task in this wave failed";

/// Flags accepted by `mason execute`.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub selection: Selection,
    /// Validate and plan only: no lock, branch, commit, or dispatch.
    pub dry_run: bool,
    /// Skip git state validation.
    pub force: bool,
    /// Do not ask for confirmation.
    pub auto: bool,
    pub takeover: Takeover,
    /// Release the lock on SIGINT/SIGTERM/SIGHUP. Only the binary sets this.
    pub handle_signals: bool,
}

/// The waves planned for one selected item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemPlan {
    pub item: BacklogItem,
    /// Run left behind by an interrupted invocation, continued instead of
    /// starting a new one.
    pub resume_run_id: Option<String>,
    pub waves: Vec<Wave>,
}

impl ItemPlan {
    fn from_candidate(candidate: Candidate) -> Self {
        let waves = generate_waves_for_item(&candidate.item);
        Self {
            item: candidate.item,
            resume_run_id: candidate.resume_run_id,
            waves,
        }
    }

    pub fn total_tasks(&self) -> usize {
        self.waves.iter().map(|w| w.tasks.len()).sum()
    }
}

/// Final state of one processed item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemReport {
    pub item_id: String,
    pub title: String,
    pub run_id: Option<String>,
    pub branch: Option<String>,
    pub status: ItemStatus,
    pub error: Option<String>,
}

/// Outcome of `mason execute`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// No eligible item matched the selection.
    NothingToDo,
    DryRun { plans: Vec<ItemPlan> },
    /// The operator answered no at the confirmation prompt.
    Declined { plans: Vec<ItemPlan> },
    Executed {
        backup: Backup,
        reports: Vec<ItemReport>,
    },
}

impl ExecuteOutcome {
    /// True unless an executed item ended `failed`.
    pub fn all_completed(&self) -> bool {
        match self {
            ExecuteOutcome::Executed { reports, .. } => reports
                .iter()
                .all(|r| r.status == ItemStatus::Completed),
            _ => true,
        }
    }
}

/// Run `mason execute` against the repository at `paths.repo`.
///
/// `confirm` is shown the plans before anything is mutated unless `auto` or
/// `dry_run` is set; returning false ends the invocation with
/// [`ExecuteOutcome::Declined`].
#[instrument(skip_all, fields(repo = %paths.repo.display(), dry_run = options.dry_run))]
pub fn execute(
    paths: &MasonPaths,
    config: &OrchestratorConfig,
    executor: &dyn TaskExecutor,
    options: &ExecuteOptions,
    confirm: &mut dyn FnMut(&[ItemPlan]) -> Result<bool>,
) -> Result<ExecuteOutcome> {
    config.validate().context("invalid configuration")?;

    let git = Git::new(&paths.repo);
    let issues = validate_git_state(&git, &[&config.branch_prefix, &config.backup_prefix])?;
    if !issues.is_empty() {
        if !options.force {
            return Err(GitStateInvalid { issues }.into());
        }
        for issue in &issues {
            warn!(issue = %issue.issue, "ignoring git state issue (--force)");
        }
    }

    ensure_data_dir(paths)?;

    if options.dry_run {
        let store = Store::open(&paths.db_path)?;
        let plans = select_plans(&store, &options.selection)?;
        store.close()?;
        return Ok(if plans.is_empty() {
            ExecuteOutcome::NothingToDo
        } else {
            ExecuteOutcome::DryRun { plans }
        });
    }

    let guard = lock::acquire(&paths.lock_path, &paths.repo, LOCK_COMMAND, options.takeover)?;
    if options.handle_signals {
        signals::install(guard.path().to_path_buf(), guard.info().token.clone())?;
    }

    let mut store = Store::open(&paths.db_path)?;
    let plans = select_plans(&store, &options.selection)?;
    if plans.is_empty() {
        info!("no eligible items");
        store.close()?;
        release_lock(guard);
        return Ok(ExecuteOutcome::NothingToDo);
    }
    let branches = BranchManager::new(git);
    let reused = reused_base(&store, &plans, &branches, config)?;
    if !options.auto && !confirm(&plans)? {
        store.close()?;
        release_lock(guard);
        return Ok(ExecuteOutcome::Declined { plans });
    }

    let backup = match reused {
        Some(backup) => backup,
        None => branches
            .create_backup_branch(&config.backup_prefix, Utc::now())
            .context("create backup branch")?,
    };

    let mut driver = Driver {
        store: &mut store,
        branches: &branches,
        config,
        executor,
        repo: paths.repo.clone(),
    };
    let mut reports = Vec::with_capacity(plans.len());
    for plan in &plans {
        let report = driver.run_item(plan, &backup)?;
        info!(item_id = %report.item_id, status = %report.status, "item finished");
        reports.push(report);
    }

    match branches.restore_original_branch(&backup) {
        Ok(true) => debug!("restored original branch"),
        Ok(false) => {}
        Err(err) => warn!(err = %err, "failed to restore original branch"),
    }
    store.close()?;
    release_lock(guard);
    Ok(ExecuteOutcome::Executed { backup, reports })
}

fn release_lock(guard: lock::LockGuard) {
    if let Err(err) = guard.release() {
        warn!(err = %err, "failed to release lock");
    }
}

/// The base recorded by an interrupted invocation, when HEAD was left on one of
/// its working branches.
///
/// New working branches must start from the operator's branch, never from
/// another item's partial commits, so that invocation's backup and original
/// branch are reused instead of snapshotting the current HEAD. Being on a
/// working branch with nothing to resume is a git state error.
fn reused_base(
    store: &Store,
    plans: &[ItemPlan],
    branches: &BranchManager,
    config: &OrchestratorConfig,
) -> Result<Option<Backup>> {
    let Some(branch) = branches
        .git()
        .current_branch()?
        .filter(|b| b.starts_with(config.branch_prefix.as_str()))
    else {
        return Ok(None);
    };

    let mut resumed = Vec::new();
    for run_id in plans.iter().filter_map(|p| p.resume_run_id.as_deref()) {
        resumed.push(store.require_run(run_id)?);
    }
    if resumed.is_empty() {
        return Err(GitStateInvalid {
            issues: vec![GitStateIssue::new(
                format!("HEAD is on working branch '{branch}' and no interrupted run is selected"),
                "check out the branch new items should start from",
            )],
        }
        .into());
    }
    let idx = resumed
        .iter()
        .position(|run| run.branch_name == branch)
        .unwrap_or(0);
    let run = resumed.swap_remove(idx);
    info!(
        run_id = %run.id,
        branch = %branch,
        backup_branch = %run.backup_branch,
        "reusing base of interrupted invocation"
    );
    Ok(Some(Backup {
        original_branch: run.original_branch,
        original_head: run.original_head,
        backup_branch: run.backup_branch,
    }))
}

/// Eligible items: approved ones plus in-progress ones with an open run.
fn select_plans(store: &Store, selection: &Selection) -> Result<Vec<ItemPlan>> {
    let mut candidates: Vec<Candidate> = store
        .list_items(Some(ItemStatus::Approved))?
        .into_iter()
        .map(|item| Candidate {
            item,
            resume_run_id: None,
        })
        .collect();
    candidates.extend(
        store
            .resumable_items()?
            .into_iter()
            .map(|(item, run_id)| Candidate {
                item,
                resume_run_id: Some(run_id),
            }),
    );
    let all_items = match selection {
        Selection::Ids(_) => store.list_items(None)?,
        _ => Vec::new(),
    };
    let selected = select_items(selection, candidates, &all_items)?;
    Ok(selected.into_iter().map(ItemPlan::from_candidate).collect())
}

struct Driver<'a> {
    store: &'a mut Store,
    branches: &'a BranchManager,
    config: &'a OrchestratorConfig,
    executor: &'a dyn TaskExecutor,
    repo: PathBuf,
}

impl Driver<'_> {
    /// Process one item. Store failures are returned as errors and end the
    /// invocation; git failures only fail this item's run.
    #[instrument(skip_all, fields(item_id = %plan.item.id))]
    fn run_item(&mut self, plan: &ItemPlan, backup: &Backup) -> Result<ItemReport> {
        let item = &plan.item;
        let tasks = planned_tasks(&plan.waves);
        let total_waves = u32::try_from(plan.waves.len()).context("wave count overflow")?;

        let run = match &plan.resume_run_id {
            Some(run_id) => {
                let run = self.store.require_run(run_id)?;
                let rows = self.store.tasks_for_run(&run.id)?;
                let diff = reconcile(&tasks, &rows);
                if !diff.unplanned.is_empty() {
                    warn!(run_id = %run.id, unplanned = ?diff.unplanned, "persisted tasks no longer in plan");
                }
                let inserted = self.store.insert_missing_tasks(&run.id, &diff.missing)?;
                info!(run_id = %run.id, inserted, "resuming interrupted run");
                run
            }
            None => {
                let branch_name = match &item.branch_name {
                    Some(existing) => existing.clone(),
                    None => match self
                        .branches
                        .generate_branch_name(&self.config.branch_prefix, &item.title)
                    {
                        Ok(name) => name,
                        Err(err) => {
                            return Ok(unclaimed_failure(item, format!("{err:#}")));
                        }
                    },
                };
                self.store.create_run(NewRun {
                    item_id: &item.id,
                    branch_name: &branch_name,
                    backup_branch: &backup.backup_branch,
                    original_head: &backup.original_head,
                    original_branch: backup.original_branch.as_deref(),
                    total_waves,
                    tasks: &tasks,
                })?
            }
        };

        // Checking out the working branch is the first step of a running run.
        if run.status == RunStatus::Pending {
            self.store.transition_run(&run.id, RunStatus::Running, None)?;
        }
        if let Err(err) = self
            .branches
            .create_branch(&run.branch_name, &run.original_head)
        {
            let message = format!("branch creation failed: {err:#}");
            warn!(run_id = %run.id, error = %message, "failing run");
            return self.finalize(&run, item, Some(message));
        }

        let mut failed = any_failed(&self.store.tasks_for_run(&run.id)?);
        for wave in &plan.waves {
            let rows = self.store.tasks_for_run(&run.id)?;
            let open = dispatchable(&rows, wave.number);
            if open.is_empty() {
                continue;
            }
            if failed && self.config.failure_policy == FailurePolicy::Stop {
                // Only a wave interrupted mid-flight has running rows here.
                let interrupted: Vec<String> = open
                    .iter()
                    .filter(|t| t.status == TaskStatus::Running)
                    .map(|t| t.id.clone())
                    .collect();
                if !interrupted.is_empty() {
                    self.store.skip_tasks(&interrupted, SKIP_REASON)?;
                }
                break;
            }

            let wave_failed = self.run_wave(&run, item, wave.number, total_waves, open)?;
            let mut message = format!(
                "mason({}): {} [wave {}/{}]",
                short_id(&run.id),
                item.title,
                wave.number,
                total_waves
            );
            if wave_failed {
                message.push_str(" (failed)");
            }
            if let Err(err) = self.branches.commit_changes(&message) {
                let message = format!("commit after wave {} failed: {err:#}", wave.number);
                warn!(run_id = %run.id, error = %message, "failing run");
                return self.finalize(&run, item, Some(message));
            }
            failed |= wave_failed;
        }

        self.finalize(&run, item, None)
    }

    /// Dispatch the open tasks of one wave and persist each result as it
    /// arrives. Returns true if any task failed.
    fn run_wave(
        &mut self,
        run: &ExecutionRun,
        item: &BacklogItem,
        wave: u32,
        total_waves: u32,
        open: Vec<ExecutionTask>,
    ) -> Result<bool> {
        self.store.advance_wave(&run.id, wave)?;
        let ids: Vec<String> = open.iter().map(|t| t.id.clone()).collect();
        self.store.start_tasks(&ids)?;
        info!(run_id = %run.id, wave, tasks = ids.len(), "dispatching wave");

        let requests: Vec<TaskRequest> = open
            .into_iter()
            .map(|task| TaskRequest {
                run_id: run.id.clone(),
                task_id: task.id,
                wave,
                task_number: task.task_number,
                total_waves,
                subagent_type: task.subagent_type,
                description: task.description,
                item_title: item.title.clone(),
                item_problem: item.problem.clone(),
                item_solution: item.solution.clone(),
                repo: self.repo.clone(),
                branch: run.branch_name.clone(),
            })
            .collect();

        let store = &mut *self.store;
        let halt = self.config.failure_policy == FailurePolicy::Stop;
        let summary = dispatch_wave(
            self.executor,
            requests,
            self.config.max_concurrency,
            halt,
            |result: &TaskResult| {
                let task = match &result.outcome {
                    Ok(output) => {
                        store.finish_task(&result.task_id, TaskStatus::Completed, Some(output), None)?
                    }
                    Err(error) => {
                        warn!(task_id = %result.task_id, wave, error = %error, "task failed");
                        store.finish_task(&result.task_id, TaskStatus::Failed, None, Some(error))?
                    }
                };
                debug!(task_id = %task.id, status = %task.status, "task recorded");
                Ok(())
            },
        )?;

        if !summary.not_started.is_empty() {
            self.store.skip_tasks(&summary.not_started, SKIP_REASON)?;
        }
        Ok(summary.finished.iter().any(|r| !r.succeeded()))
    }

    /// Write the run's terminal state and the matching item status.
    fn finalize(
        &mut self,
        run: &ExecutionRun,
        item: &BacklogItem,
        error: Option<String>,
    ) -> Result<ItemReport> {
        let rows = self.store.tasks_for_run(&run.id)?;
        let error = error.or_else(|| first_failure(&rows));
        let completed = error.is_none() && rows.iter().all(|t| t.status == TaskStatus::Completed);
        let (status, error) = if completed {
            (RunStatus::Completed, None)
        } else {
            (
                RunStatus::Failed,
                Some(error.unwrap_or_else(|| "run ended with unfinished tasks".to_string())),
            )
        };
        let run = self.store.finish_run(&run.id, status, error.as_deref())?;
        Ok(ItemReport {
            item_id: item.id.clone(),
            title: item.title.clone(),
            run_id: Some(run.id),
            branch: Some(run.branch_name),
            status: if completed {
                ItemStatus::Completed
            } else {
                ItemStatus::Failed
            },
            error,
        })
    }
}

/// Report for an item that failed before a run could be created. The item
/// stays `approved`.
fn unclaimed_failure(item: &BacklogItem, error: String) -> ItemReport {
    warn!(item_id = %item.id, error = %error, "item could not be claimed");
    ItemReport {
        item_id: item.id.clone(),
        title: item.title.clone(),
        run_id: None,
        branch: None,
        status: ItemStatus::Failed,
        error: Some(error),
    }
}

fn first_failure(rows: &[ExecutionTask]) -> Option<String> {
    rows.iter()
        .find(|t| t.status == TaskStatus::Failed)
        .map(|t| {
            format!(
                "wave {} task {} ({}) failed: {}",
                t.wave,
                t.task_number,
                t.subagent_type,
                t.error_message.as_deref().unwrap_or("no error message")
            )
        })
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
