//! Branch, backup, and commit operations on the working tree.
//!
//! Only the driver calls into this module, and only while it holds the
//! repository lock. The backup branch created here is the single manual
//! recovery anchor: nothing in the orchestrator ever moves or deletes it.

use std::collections::HashSet;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::core::branch_name::{disambiguate, generate_branch_name};
use crate::io::git::Git;

/// Snapshot taken once before any branch mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    /// Branch checked out when the snapshot was taken.
    pub original_branch: Option<String>,
    /// Full hash of HEAD at snapshot time.
    pub original_head: String,
    /// Name of the backup branch pointing at `original_head`.
    pub backup_branch: String,
}

/// What `commit_changes` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { commit: String },
    NothingToCommit,
}

/// Branch and commit operations for one repository.
#[derive(Debug, Clone)]
pub struct BranchManager {
    git: Git,
}

impl BranchManager {
    pub fn new(git: Git) -> Self {
        Self { git }
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    pub fn get_head_commit(&self) -> Result<String> {
        self.git.head_commit().context("read HEAD commit")
    }

    /// Record HEAD and create `<prefix><timestamp>` pointing at it.
    #[instrument(skip_all, fields(prefix))]
    pub fn create_backup_branch(&self, prefix: &str, now: DateTime<Utc>) -> Result<Backup> {
        let original_head = self.get_head_commit()?;
        let original_branch = self.git.current_branch()?;
        let base = format!("{prefix}{}", now.format("%Y%m%d-%H%M%S"));
        let existing = self.branch_set()?;
        let backup_branch = disambiguate(&base, |name| existing.contains(name))
            .ok_or_else(|| anyhow!("unable to find a free backup branch name for '{base}'"))?;
        self.git
            .create_branch_at(&backup_branch, &original_head)
            .with_context(|| format!("create backup branch {backup_branch}"))?;
        info!(backup_branch = %backup_branch, original_head = %original_head, "backup branch created");
        Ok(Backup {
            original_branch,
            original_head,
            backup_branch,
        })
    }

    /// Deterministic working-branch name for `title`, avoiding existing branches.
    pub fn generate_branch_name(&self, prefix: &str, title: &str) -> Result<String> {
        let existing = self.branch_set()?;
        generate_branch_name(prefix, title, |name| existing.contains(name))
            .ok_or_else(|| anyhow!("unable to find a free branch name for '{title}'"))
    }

    /// Check out `name`, creating it at `start_point` if it does not exist yet.
    ///
    /// Returns true if the branch was created.
    #[instrument(skip_all, fields(name, start_point))]
    pub fn create_branch(&self, name: &str, start_point: &str) -> Result<bool> {
        if self.git.branch_exists(name)? {
            debug!(branch = name, "branch exists, checking out");
            self.git
                .checkout_branch(name)
                .with_context(|| format!("checkout existing branch {name}"))?;
            return Ok(false);
        }
        self.git
            .checkout_new_branch(name, start_point)
            .with_context(|| format!("create branch {name}"))?;
        info!(branch = name, "working branch created");
        Ok(true)
    }

    /// Stage everything and commit. An empty change set is a success.
    #[instrument(skip_all)]
    pub fn commit_changes(&self, message: &str) -> Result<CommitOutcome> {
        self.git.add_all()?;
        if !self.git.commit_staged(message)? {
            return Ok(CommitOutcome::NothingToCommit);
        }
        let commit = self.git.head_commit()?;
        debug!(commit = %commit, "committed wave changes");
        Ok(CommitOutcome::Committed { commit })
    }

    /// Return to the branch that was checked out before the invocation, if the
    /// working tree is clean. Returns true if a checkout happened.
    pub fn restore_original_branch(&self, backup: &Backup) -> Result<bool> {
        let Some(original) = backup.original_branch.as_deref() else {
            return Ok(false);
        };
        if self.git.current_branch()?.as_deref() == Some(original) {
            return Ok(false);
        }
        if !self.git.status_porcelain()?.is_empty() {
            debug!("working tree dirty, staying on current branch");
            return Ok(false);
        }
        self.git.checkout_branch(original)?;
        Ok(true)
    }

    fn branch_set(&self) -> Result<HashSet<String>> {
        Ok(self.git.list_branches()?.into_iter().collect())
    }
}
