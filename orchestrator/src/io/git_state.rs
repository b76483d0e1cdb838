//! Pre-flight validation of the repository before the orchestrator mutates it.

use anyhow::Result;
use tracing::{debug, instrument, warn};

use crate::io::git::Git;

/// One disqualifying condition plus what the operator can do about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitStateIssue {
    pub issue: String,
    pub suggestion: String,
}

impl GitStateIssue {
    pub(crate) fn new(issue: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self {
            issue: issue.into(),
            suggestion: suggestion.into(),
        }
    }
}

/// Returned by the driver when validation fails and `--force` was not given.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", describe_issues(.issues))]
pub struct GitStateInvalid {
    pub issues: Vec<GitStateIssue>,
}

fn describe_issues(issues: &[GitStateIssue]) -> String {
    let mut out = String::from("repository is not ready for execution:\n");
    for issue in issues {
        out.push_str(&format!("- {}\n  fix: {}\n", issue.issue, issue.suggestion));
    }
    out.push_str("re-run with --force to bypass these checks");
    out
}

/// Markers git leaves in `.git/` while an operation awaits conflict resolution.
const IN_PROGRESS_MARKERS: [(&str, &str); 5] = [
    ("MERGE_HEAD", "merge"),
    ("rebase-merge", "rebase"),
    ("rebase-apply", "rebase"),
    ("CHERRY_PICK_HEAD", "cherry-pick"),
    ("REVERT_HEAD", "revert"),
];

/// Inspect the repository and list every condition that makes execution unsafe.
///
/// `ref_prefixes` are the branch prefixes the orchestrator will create refs
/// under (e.g. `mason/`); an existing branch named like the prefix directory
/// would make every such ref creation fail.
#[instrument(skip_all, fields(repo = %git.workdir().display()))]
pub fn validate_git_state(git: &Git, ref_prefixes: &[&str]) -> Result<Vec<GitStateIssue>> {
    let mut issues = Vec::new();

    if !git.is_repository()? {
        issues.push(GitStateIssue::new(
            format!("{} is not a git repository", git.workdir().display()),
            "run inside a git checkout or pass --repo <path>",
        ));
        return Ok(issues);
    }

    if git.head_commit().is_err() {
        issues.push(GitStateIssue::new(
            "repository has no commits",
            "create an initial commit before executing items",
        ));
        return Ok(issues);
    }

    let dirty = git.status_porcelain()?;
    if !dirty.is_empty() {
        let preview: Vec<String> = dirty
            .iter()
            .take(5)
            .map(|e| format!("{} {}", e.code, e.path))
            .collect();
        let more = dirty.len().saturating_sub(preview.len());
        let mut issue = format!("working tree has uncommitted changes: {}", preview.join(", "));
        if more > 0 {
            issue.push_str(&format!(" (+{more} more)"));
        }
        issues.push(GitStateIssue::new(
            issue,
            "commit or stash your changes (git stash -u)",
        ));
    }

    if git.current_branch()?.is_none() {
        issues.push(GitStateIssue::new(
            "HEAD is detached",
            "check out a branch first (git switch <branch>)",
        ));
    }

    let git_dir = git.git_dir()?;
    for (marker, operation) in IN_PROGRESS_MARKERS {
        if git_dir.join(marker).exists() {
            issues.push(GitStateIssue::new(
                format!("a {operation} is in progress"),
                format!("finish or abort it (git {operation} --continue / --abort)"),
            ));
            break;
        }
    }

    for prefix in ref_prefixes {
        let dir = prefix.trim_end_matches('/');
        if prefix.ends_with('/') && !dir.is_empty() && git.branch_exists(dir)? {
            issues.push(GitStateIssue::new(
                format!("branch '{dir}' exists and blocks creating branches under '{prefix}'"),
                format!("rename it (git branch -m {dir} {dir}-old) or change the prefix in config.toml"),
            ));
        }
    }

    if issues.is_empty() {
        debug!("git state is clean");
    } else {
        warn!(count = issues.len(), "git state issues found");
    }
    Ok(issues)
}
