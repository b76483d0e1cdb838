//! Test-only helpers: a throwaway git repository, a scripted task executor,
//! and item builders.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use crate::io::executor::{TaskError, TaskExecutor, TaskRequest};
use crate::io::git::Git;
use crate::io::init::{MasonPaths, ensure_data_dir};
use crate::io::store::{NewItem, Store};

/// A git repository in a temp directory with one commit on `main`.
pub struct TestRepo {
    dir: tempfile::TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = Self { dir };
        repo.git(&["init", "-q"]);
        repo.git(&["checkout", "-q", "-b", "main"]);
        repo.git(&["config", "user.name", "Mason Test"]);
        repo.git(&["config", "user.email", "mason@example.com"]);
        repo.git(&["config", "commit.gpgsign", "false"]);
        repo.write("README.md", "# test repo\n");
        repo.git(&["add", "-A"]);
        repo.git(&["commit", "-q", "-m", "initial"]);
        repo
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn paths(&self) -> MasonPaths {
        MasonPaths::new(self.path(), None)
    }

    pub fn handle(&self) -> Git {
        Git::new(self.path())
    }

    /// Open (and create) the store under the default data directory.
    pub fn store(&self) -> Store {
        let paths = self.paths();
        ensure_data_dir(&paths).expect("init data dir");
        Store::open(paths.db_path).expect("open store")
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, contents).expect("write file");
    }

    /// Run git and return trimmed stdout; panics on failure.
    pub fn git(&self, args: &[&str]) -> String {
        let out = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .expect("spawn git");
        assert!(
            out.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    }

    pub fn head(&self) -> String {
        self.git(&["rev-parse", "HEAD"])
    }

    pub fn branches(&self) -> Vec<String> {
        self.git(&["for-each-ref", "--format=%(refname:short)", "refs/heads"])
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn current_branch(&self) -> String {
        self.git(&["rev-parse", "--abbrev-ref", "HEAD"])
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// One executor event, recorded in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    Started { wave: u32, task_number: u32 },
    Finished { wave: u32, task_number: u32 },
}

/// Deterministic executor double.
///
/// Fails the `(wave, task_number)` pairs it was told to, optionally writes a
/// file per task into the repository, and records start/finish order.
#[derive(Default)]
pub struct ScriptedExecutor {
    failures: BTreeSet<(u32, u32)>,
    write_files: bool,
    delay: Duration,
    events: Mutex<Vec<TaskEvent>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, wave: u32, task_number: u32) -> Self {
        self.failures.insert((wave, task_number));
        self
    }

    /// Write `mason-out/wave<W>-task<N>.txt` for every task, so waves have
    /// something to commit.
    pub fn writing_files(mut self) -> Self {
        self.write_files = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().expect("events lock").clone()
    }

    /// `(wave, task_number)` in start order.
    pub fn started(&self) -> Vec<(u32, u32)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                TaskEvent::Started { wave, task_number } => Some((wave, task_number)),
                TaskEvent::Finished { .. } => None,
            })
            .collect()
    }

    fn record(&self, event: TaskEvent) {
        self.events.lock().expect("events lock").push(event);
    }
}

impl TaskExecutor for ScriptedExecutor {
    fn execute(&self, request: &TaskRequest) -> Result<String, TaskError> {
        let (wave, task_number) = (request.wave, request.task_number);
        self.record(TaskEvent::Started { wave, task_number });
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.write_files {
            let path: PathBuf = request
                .repo
                .join("mason-out")
                .join(format!("wave{wave}-task{task_number}.txt"));
            fs::create_dir_all(path.parent().expect("parent")).expect("create out dir");
            fs::write(&path, &request.description).expect("write task file");
        }
        self.record(TaskEvent::Finished { wave, task_number });
        if self.failures.contains(&(wave, task_number)) {
            return Err(TaskError::new(format!(
                "scripted failure in wave {wave} task {task_number}"
            )));
        }
        Ok(format!("{} done", request.subagent_type))
    }
}

/// An approved item with a list-style solution.
///
/// Complexity 3 plans 2 exploration tasks, `steps.len()` implementation tasks
/// (up to 4), and 2 verification tasks.
pub fn approved_item(title: &str, steps: &[&str]) -> NewItem {
    let solution = steps
        .iter()
        .map(|s| format!("- {s}"))
        .collect::<Vec<_>>()
        .join("\n");
    NewItem {
        problem: format!("{title} is missing"),
        solution,
        complexity: 3,
        ..NewItem::approved(title)
    }
}

/// Same as [`approved_item`] with a fixed id and priority.
pub fn approved_item_with(id: &str, title: &str, priority: i64, steps: &[&str]) -> NewItem {
    NewItem {
        id: Some(id.to_string()),
        priority,
        ..approved_item(title, steps)
    }
}
