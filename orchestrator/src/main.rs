//! `mason`: execute approved backlog items as branch-per-item changes.
//!
//! State lives under `<repo>/.mason/` (SQLite store, lock file, config). See
//! `mason --help` for commands.

use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use orchestrator::core::selection::Selection;
use orchestrator::core::types::{ItemStatus, TaskStatus};
use orchestrator::execute::{ExecuteOptions, ExecuteOutcome, ItemPlan, execute};
use orchestrator::exit_codes;
use orchestrator::io::config::{OrchestratorConfig, load_config, write_config};
use orchestrator::io::executor::build_executor;
use orchestrator::io::git_state::GitStateInvalid;
use orchestrator::io::init::{MasonPaths, ensure_data_dir};
use orchestrator::io::lock::{LockError, Takeover};
use orchestrator::io::store::Store;
use orchestrator::{items, logging, status};

#[derive(Parser)]
#[command(
    name = "mason",
    version,
    about = "Execute approved backlog items as branch-per-item changes"
)]
struct Cli {
    /// Repository to operate on.
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Data directory for the store, lock, and config [default: <repo>/.mason].
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Plan and execute approved items.
    Execute(ExecuteArgs),
    /// Import, list, and approve backlog items.
    #[command(subcommand)]
    Items(ItemsCommand),
    /// Inspect execution runs.
    #[command(subcommand)]
    Runs(RunsCommand),
    /// Inspect or clear the repository lock.
    #[command(subcommand)]
    Lock(LockCommand),
    /// Write a default `config.toml` into the data directory.
    InitConfig {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Args, Debug)]
struct ExecuteArgs {
    /// Execute this item (repeatable). Each id must be approved or resumable.
    #[arg(long = "item", value_name = "ID")]
    items: Vec<String>,

    /// Execute the N highest-priority eligible items.
    #[arg(long, value_name = "N", conflicts_with_all = ["items", "all"])]
    top: Option<usize>,

    /// Execute every eligible item.
    #[arg(long, conflicts_with = "items")]
    all: bool,

    /// Validate and print the plan without locking, branching, or dispatching.
    #[arg(long)]
    dry_run: bool,

    /// Skip git state validation.
    #[arg(long)]
    force: bool,

    /// Do not ask for confirmation.
    #[arg(long, visible_alias = "yes")]
    auto: bool,

    /// Replace a lock left behind by a process that no longer exists.
    #[arg(long)]
    takeover_stale_lock: bool,
}

impl ExecuteArgs {
    fn selection(&self) -> Selection {
        if !self.items.is_empty() {
            Selection::Ids(self.items.clone())
        } else if self.all {
            Selection::All
        } else {
            Selection::Top(self.top.unwrap_or(1))
        }
    }
}

#[derive(Subcommand)]
enum ItemsCommand {
    /// Insert items from a JSON array file.
    Import { file: PathBuf },
    /// List items by priority.
    List {
        #[arg(long)]
        status: Option<ItemStatus>,
    },
    /// Approve new or failed items.
    Approve {
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

#[derive(Subcommand)]
enum RunsCommand {
    /// Most recent runs first.
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// A run with its per-wave task table.
    Show { run_id: String },
}

#[derive(Subcommand)]
enum LockCommand {
    /// Print who holds the lock.
    Status,
    /// Remove a stale lock. A live holder is never removed.
    Clear,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(exit_code_for(&err));
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<GitStateInvalid>().is_some() {
        return exit_codes::GIT_STATE;
    }
    match err.downcast_ref::<LockError>() {
        Some(LockError::LockHeld { .. } | LockError::StaleLock { .. }) => exit_codes::LOCK_HELD,
        _ => exit_codes::INVALID,
    }
}

fn run(cli: Cli) -> Result<i32> {
    let repo = std::fs::canonicalize(&cli.repo)
        .with_context(|| format!("repository path {}", cli.repo.display()))?;
    let paths = MasonPaths::new(repo, cli.data_dir);
    match cli.command {
        Command::Execute(args) => cmd_execute(&paths, &args),
        Command::Items(cmd) => cmd_items(&paths, cmd),
        Command::Runs(cmd) => cmd_runs(&paths, cmd),
        Command::Lock(cmd) => cmd_lock(&paths, cmd),
        Command::InitConfig { force } => cmd_init_config(&paths, force),
    }
}

fn cmd_execute(paths: &MasonPaths, args: &ExecuteArgs) -> Result<i32> {
    let config = load_config(&paths.config_path)?;
    let executor = build_executor(&config.executor)?;
    let options = ExecuteOptions {
        selection: args.selection(),
        dry_run: args.dry_run,
        force: args.force,
        auto: args.auto,
        takeover: if args.takeover_stale_lock {
            Takeover::Stale
        } else {
            Takeover::Never
        },
        handle_signals: true,
    };

    let outcome = execute(paths, &config, executor.as_ref(), &options, &mut confirm)?;
    let all_completed = outcome.all_completed();
    Ok(match outcome {
        ExecuteOutcome::NothingToDo => {
            println!("no eligible items (approve items with `mason items approve <id>`)");
            exit_codes::OK
        }
        ExecuteOutcome::DryRun { plans } => {
            print_plans(&plans);
            println!("dry run: no lock taken, no branches or commits created");
            exit_codes::OK
        }
        ExecuteOutcome::Declined { .. } => {
            println!("aborted");
            exit_codes::DECLINED
        }
        ExecuteOutcome::Executed { backup, reports } => {
            for report in &reports {
                let mut line = format!("{:<10} {}  {}", report.status, report.item_id, report.title);
                if let Some(branch) = &report.branch {
                    line.push_str(&format!("  branch {branch}"));
                }
                if let Some(run_id) = &report.run_id {
                    line.push_str(&format!("  run {run_id}"));
                }
                println!("{line}");
                if let Some(error) = &report.error {
                    println!("           {error}");
                }
            }
            println!(
                "backup branch {} at {}",
                backup.backup_branch, backup.original_head
            );
            if all_completed {
                exit_codes::OK
            } else {
                exit_codes::ITEMS_FAILED
            }
        }
    })
}

fn print_plans(plans: &[ItemPlan]) {
    for plan in plans {
        let resume = plan
            .resume_run_id
            .as_deref()
            .map(|id| format!(" (resuming run {id})"))
            .unwrap_or_default();
        println!("item {} \"{}\"{resume}", plan.item.id, plan.item.title);
        for wave in &plan.waves {
            let kinds: Vec<&str> = wave.tasks.iter().map(|t| t.subagent_type.as_str()).collect();
            println!(
                "  wave {}: {} tasks ({})",
                wave.number,
                wave.tasks.len(),
                kinds.join(", ")
            );
        }
        println!(
            "  total: {} tasks in {} waves",
            plan.total_tasks(),
            plan.waves.len()
        );
    }
}

fn confirm(plans: &[ItemPlan]) -> Result<bool> {
    print_plans(plans);
    print!("Proceed? [y/N] ");
    std::io::stdout().flush().context("flush stdout")?;
    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("read confirmation")?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn open_store(paths: &MasonPaths) -> Result<Store> {
    ensure_data_dir(paths)?;
    Ok(Store::open(&paths.db_path)?)
}

fn cmd_items(paths: &MasonPaths, cmd: ItemsCommand) -> Result<i32> {
    let mut store = open_store(paths)?;
    match cmd {
        ItemsCommand::Import { file } => {
            let imported = items::import_items(&mut store, &file)?;
            for item in &imported {
                println!("{}\t{}\t{}", item.id, item.status, item.title);
            }
            println!("imported {} items", imported.len());
        }
        ItemsCommand::List { status } => {
            for item in store.list_items(status)? {
                println!(
                    "{}\t{}\tp{}\tc{}\t{}\t{}",
                    item.id,
                    item.status,
                    item.priority,
                    item.complexity,
                    item.item_type,
                    item.title
                );
            }
        }
        ItemsCommand::Approve { ids } => {
            for item in items::approve_items(&mut store, &ids)? {
                println!("{}\t{}", item.id, item.status);
            }
        }
    }
    store.close()?;
    Ok(exit_codes::OK)
}

fn cmd_runs(paths: &MasonPaths, cmd: RunsCommand) -> Result<i32> {
    let store = open_store(paths)?;
    match cmd {
        RunsCommand::List { limit } => {
            for run in store.list_runs(limit)? {
                println!(
                    "{}\t{}\twave {}/{}\t{}\t{}",
                    run.id,
                    run.status,
                    run.current_wave,
                    run.total_waves,
                    run.branch_name,
                    run.created_at
                );
            }
        }
        RunsCommand::Show { run_id } => {
            let detail = status::run_detail(&store, &run_id)?;
            let run = &detail.run;
            println!("run {} ({})", run.id, run.status);
            println!("  items: {}", run.item_ids.join(", "));
            println!("  branch: {}", run.branch_name);
            println!("  backup: {} at {}", run.backup_branch, run.original_head);
            println!("  wave: {}/{}", run.current_wave, run.total_waves);
            if let Some(error) = &run.error_message {
                println!("  error: {error}");
            }
            for wave in &detail.waves {
                let c = wave.counts;
                println!(
                    "  wave {}: {} completed, {} failed, {} skipped, {} running, {} pending",
                    wave.number, c.completed, c.failed, c.skipped, c.running, c.pending
                );
                for task in &wave.tasks {
                    println!(
                        "    {}.{} {:<15} {:<9} {}",
                        task.wave, task.task_number, task.subagent_type, task.status, task.description
                    );
                    if task.status == TaskStatus::Failed
                        && let Some(error) = &task.error_message
                    {
                        println!("        error: {error}");
                    }
                }
            }
        }
    }
    store.close()?;
    Ok(exit_codes::OK)
}

fn cmd_lock(paths: &MasonPaths, cmd: LockCommand) -> Result<i32> {
    match cmd {
        LockCommand::Status => println!("{}", status::describe_lock(paths)?),
        LockCommand::Clear => match status::clear_lock(paths)? {
            Some(holder) => println!("removed stale lock from {}", holder.describe()),
            None => println!("no lock to clear"),
        },
    }
    Ok(exit_codes::OK)
}

fn cmd_init_config(paths: &MasonPaths, force: bool) -> Result<i32> {
    if paths.config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            paths.config_path.display()
        );
    }
    ensure_data_dir(paths)?;
    write_config(&paths.config_path, &OrchestratorConfig::default())?;
    println!("wrote {}", paths.config_path.display());
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_defaults_to_top_one() {
        let cli = Cli::parse_from(["mason", "execute"]);
        let Command::Execute(args) = cli.command else {
            panic!("expected execute");
        };
        assert_eq!(args.selection(), Selection::Top(1));
        assert!(!args.dry_run && !args.force && !args.auto);
    }

    #[test]
    fn execute_parses_repeated_items() {
        let cli = Cli::parse_from(["mason", "execute", "--item", "a", "--item", "b", "--yes"]);
        let Command::Execute(args) = cli.command else {
            panic!("expected execute");
        };
        assert_eq!(
            args.selection(),
            Selection::Ids(vec!["a".to_string(), "b".to_string()])
        );
        assert!(args.auto);
    }

    #[test]
    fn top_conflicts_with_all() {
        assert!(Cli::try_parse_from(["mason", "execute", "--top", "2", "--all"]).is_err());
    }

    #[test]
    fn items_list_parses_status() {
        let cli = Cli::parse_from(["mason", "items", "list", "--status", "in_progress"]);
        assert!(matches!(
            cli.command,
            Command::Items(ItemsCommand::List {
                status: Some(ItemStatus::InProgress)
            })
        ));
    }

    #[test]
    fn lock_errors_map_to_lock_exit_code() {
        let holder = orchestrator::io::lock::LockInfo {
            pid: 1,
            command: "mason execute".into(),
            acquired_at: "2024-01-01T00:00:00Z".into(),
            repo: "/repo".into(),
            token: "t".into(),
        };
        let err = anyhow::Error::from(LockError::LockHeld { holder });
        assert_eq!(exit_code_for(&err), exit_codes::LOCK_HELD);
        let err = anyhow::Error::from(GitStateInvalid { issues: vec![] });
        assert_eq!(exit_code_for(&err), exit_codes::GIT_STATE);
        assert_eq!(exit_code_for(&anyhow::anyhow!("boom")), exit_codes::INVALID);
    }
}
