//! Git state validation and branch management against real repositories.

use std::fs;

use chrono::{TimeZone, Utc};

use orchestrator::io::branches::{BranchManager, CommitOutcome};
use orchestrator::io::git_state::validate_git_state;
use orchestrator::test_support::TestRepo;

const PREFIXES: [&str; 2] = ["mason/", "mason-backup/"];

#[test]
fn clean_repository_has_no_issues() {
    let repo = TestRepo::new();
    let issues = validate_git_state(&repo.handle(), &PREFIXES).expect("validate");
    assert!(issues.is_empty(), "{issues:?}");
}

#[test]
fn reports_dirty_tree_with_file_names() {
    let repo = TestRepo::new();
    repo.write("README.md", "changed\n");
    repo.write("new.txt", "untracked\n");

    let issues = validate_git_state(&repo.handle(), &PREFIXES).expect("validate");
    assert_eq!(issues.len(), 1);
    assert!(issues[0].issue.contains("README.md"));
    assert!(issues[0].issue.contains("new.txt"));
    assert!(issues[0].suggestion.contains("stash"));
}

#[test]
fn reports_detached_head() {
    let repo = TestRepo::new();
    let head = repo.head();
    repo.git(&["checkout", "-q", "--detach", &head]);

    let issues = validate_git_state(&repo.handle(), &PREFIXES).expect("validate");
    assert!(issues.iter().any(|i| i.issue.contains("detached")));
}

#[test]
fn reports_operation_in_progress() {
    let repo = TestRepo::new();
    let git_dir = repo.path().join(".git");
    fs::write(git_dir.join("MERGE_HEAD"), repo.head()).expect("write marker");

    let issues = validate_git_state(&repo.handle(), &PREFIXES).expect("validate");
    assert!(issues.iter().any(|i| i.issue.contains("merge is in progress")));
}

#[test]
fn reports_branch_blocking_prefix() {
    let repo = TestRepo::new();
    repo.git(&["branch", "mason"]);

    let issues = validate_git_state(&repo.handle(), &PREFIXES).expect("validate");
    assert!(issues.iter().any(|i| i.issue.contains("branch 'mason' exists")));
}

#[test]
fn backup_points_at_head_and_is_disambiguated() {
    let repo = TestRepo::new();
    let branches = BranchManager::new(repo.handle());
    let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("time");

    let first = branches
        .create_backup_branch("mason-backup/", now)
        .expect("backup");
    assert_eq!(first.backup_branch, "mason-backup/20260301-120000");
    assert_eq!(first.original_head, repo.head());
    assert_eq!(first.original_branch.as_deref(), Some("main"));
    assert_eq!(repo.git(&["rev-parse", &first.backup_branch]), repo.head());

    let second = branches
        .create_backup_branch("mason-backup/", now)
        .expect("backup");
    assert_eq!(second.backup_branch, "mason-backup/20260301-120000-2");
    // Creating a backup never moves the checkout.
    assert_eq!(repo.current_branch(), "main");
}

#[test]
fn working_branch_lifecycle() {
    let repo = TestRepo::new();
    let branches = BranchManager::new(repo.handle());
    let backup = branches
        .create_backup_branch("mason-backup/", Utc::now())
        .expect("backup");

    let name = branches
        .generate_branch_name("mason/", "Fix: the Parser!")
        .expect("name");
    assert_eq!(name, "mason/fix-the-parser");
    assert!(branches.create_branch(&name, &backup.original_head).expect("create"));
    assert_eq!(repo.current_branch(), name);

    assert_eq!(
        branches.commit_changes("empty wave").expect("commit"),
        CommitOutcome::NothingToCommit
    );
    repo.write("src/parser.txt", "fixed\n");
    let CommitOutcome::Committed { commit } =
        branches.commit_changes("mason: wave 1").expect("commit")
    else {
        panic!("expected a commit");
    };
    assert_eq!(commit, repo.head());
    assert_eq!(repo.git(&["log", "-1", "--format=%s"]), "mason: wave 1");

    // The name is now taken, so the next item with this title gets a suffix.
    assert_eq!(
        branches
            .generate_branch_name("mason/", "Fix: the Parser!")
            .expect("name"),
        "mason/fix-the-parser-2"
    );

    assert!(branches.restore_original_branch(&backup).expect("restore"));
    assert_eq!(repo.current_branch(), "main");
    assert_eq!(repo.head(), backup.original_head);

    // Re-entering an existing branch checks it out without recreating it.
    assert!(!branches.create_branch(&name, &backup.original_head).expect("reuse"));
    assert_eq!(repo.head(), commit);
}

#[test]
fn restore_is_skipped_when_tree_is_dirty() {
    let repo = TestRepo::new();
    let branches = BranchManager::new(repo.handle());
    let backup = branches
        .create_backup_branch("mason-backup/", Utc::now())
        .expect("backup");
    branches
        .create_branch("mason/dirty", &backup.original_head)
        .expect("create");
    repo.write("leftover.txt", "uncommitted\n");

    assert!(!branches.restore_original_branch(&backup).expect("restore"));
    assert_eq!(repo.current_branch(), "mason/dirty");
}
