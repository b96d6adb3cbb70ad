use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::RwLock;

use conductor::cleanup::{self, CleanupReport};
use conductor::config::Config;
use conductor::core::{TaskDescriptor, TaskId, TaskList};
use conductor::git::GitOps;
use conductor::isolation::{GitWorktreeIsolation, IsolationManager};
use conductor::merge::{self, ReviewResolution};
use conductor::notify::{ChannelNotifier, FanoutNotifier, LogNotifier, Notifier};
use conductor::orchestration::{CommandExecutor, Orchestrator, RunSummary, SlotContext};
use conductor::state::{SharedStore, TaskStore, WorkspaceRegistry, REGISTRY_FILE, STORE_FILE};
use conductor::Result;

/// Conductor - dependency-aware parallel task orchestrator
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.conductor/conductor.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default: ~/.conductor/conductor.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Repository to work in (default: current directory)
    #[arg(long, global = true)]
    pub repo: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Add tasks from a JSON or TOML task list
    Add {
        /// Task list file
        file: PathBuf,
    },

    /// Recover, then process tasks until nothing is left to do
    Run {
        /// Add tasks from this file before running
        #[arg(long)]
        tasks: Option<PathBuf>,

        /// Number of execution slots
        #[arg(long, short = 'j')]
        concurrency: Option<usize>,
    },

    /// Show every task
    Status,

    /// Clean up workspaces and tasks left by an interrupted run
    Recover,

    /// Resolve tasks waiting for review
    Review {
        #[command(subcommand)]
        action: ReviewAction,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ReviewAction {
    /// List tasks awaiting review
    List,
    /// Integrate a task's retained branch
    Accept { id: String },
    /// Discard a task's retained branch
    Reject { id: String },
}

/// Everything a command needs, opened from config.
struct Workbench {
    config: Config,
    store: SharedStore,
    isolation: Arc<IsolationManager>,
}

fn main() {
    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    }
}

fn dispatch(cli: Cli) -> Result<i32> {
    let config = Config::load(cli.config.as_deref())?;
    conductor::log::init_with_debug(&config.state_dir()?, cli.debug);
    tracing::debug!(command = ?cli.command, "starting");

    let rt = tokio::runtime::Runtime::new()?;
    match cli.command {
        Command::Add { file } => {
            let mut store = TaskStore::open(&config.state_dir()?.join(STORE_FILE))?;
            let ids = store.add_batch(load_task_list(&file)?)?;
            println!("Added {} task(s): {}", ids.len(), join_ids(&ids));
            Ok(0)
        }
        Command::Status => {
            let store = TaskStore::open(&config.state_dir()?.join(STORE_FILE))?;
            print_status(&store);
            Ok(0)
        }
        Command::Run { tasks, concurrency } => {
            let bench = open_workbench(config, cli.repo.as_deref())?;
            let summary = rt.block_on(run(bench, tasks, concurrency))?;
            print_summary(&summary);
            Ok(if summary.blocked.is_empty() { 0 } else { 2 })
        }
        Command::Recover => {
            let bench = open_workbench(config, cli.repo.as_deref())?;
            let report = rt.block_on(cleanup::recover(&bench.store, bench.isolation.clone()))?;
            print_recovery(&report);
            Ok(if report.is_success() { 0 } else { 1 })
        }
        Command::Review { action } => {
            let bench = open_workbench(config, cli.repo.as_deref())?;
            rt.block_on(review(bench, action))
        }
    }
}

fn open_workbench(config: Config, repo: Option<&Path>) -> Result<Workbench> {
    let repo = match repo {
        Some(path) => path.to_path_buf(),
        None => std::env::current_dir()?,
    };
    let git = GitOps::new(&repo)?;
    let target = match &config.target_branch {
        Some(branch) => branch.clone(),
        None => git.current_branch()?,
    };
    config.ensure_dirs()?;
    let state_dir = config.state_dir()?;

    let store = TaskStore::open(&state_dir.join(STORE_FILE))?;
    let registry = WorkspaceRegistry::open(&state_dir.join(REGISTRY_FILE))?;
    let provider = GitWorktreeIsolation::new(git.repo_path(), &target)?;
    let isolation = IsolationManager::new(
        Arc::new(provider),
        registry,
        &config.worktree_dir()?,
        &config.branch_prefix,
        &target,
    );
    tracing::info!(repo = %repo.display(), target = %target, "workbench opened");

    Ok(Workbench {
        config,
        store: Arc::new(RwLock::new(store)),
        isolation: Arc::new(isolation),
    })
}

async fn run(bench: Workbench, tasks: Option<PathBuf>, concurrency: Option<usize>) -> Result<RunSummary> {
    let Workbench {
        config,
        store,
        isolation,
    } = bench;

    if let Some(file) = tasks {
        let ids = store.write().await.add_batch(load_task_list(&file)?)?;
        println!("Added {} task(s)", ids.len());
    }

    let report = cleanup::recover(&store, isolation.clone()).await?;
    if !report.is_clean() {
        print_recovery(&report);
    }

    let concurrency = concurrency.unwrap_or(config.concurrency);
    let ctx = SlotContext {
        executor: Arc::new(CommandExecutor::new(&config.executor.command)?),
        cascade: config.cascade(),
        isolation,
        weights: config.scoring.weights,
        policy: config.merge,
        task_timeout: config.task_timeout(),
        max_debug_retries: config.max_debug_retries,
        complexity_budget_lines: config.scoring.complexity_budget_lines,
    };

    let (channel, mut events) = ChannelNotifier::new();
    let notifier: Arc<dyn Notifier> = Arc::new(
        FanoutNotifier::new()
            .with(Arc::new(LogNotifier))
            .with(Arc::new(channel)),
    );
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let confidence = event
                .confidence
                .map(|c| format!(" ({:.2})", c))
                .unwrap_or_default();
            match &event.diagnostic {
                Some(diag) => println!("[{}] {}{}: {}", event.outcome, event.task_id, confidence, diag),
                None => println!("[{}] {}{}", event.outcome, event.task_id, confidence),
            }
        }
    });

    let mut orchestrator = Orchestrator::new(store, ctx, concurrency, notifier)?;
    let control = orchestrator.control();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Stopping: terminating in-flight tasks...");
            control.stop();
        }
    });

    println!("Running with {} slot(s)", concurrency);
    let summary = orchestrator.run().await;
    drop(orchestrator);
    let _ = printer.await;
    summary
}

async fn review(bench: Workbench, action: ReviewAction) -> Result<i32> {
    let (id, resolution) = match action {
        ReviewAction::List => {
            let reviews = bench.isolation.reviews()?;
            if reviews.is_empty() {
                println!("No tasks awaiting review");
            }
            for record in reviews {
                println!(
                    "{}  {}  confidence={}  {}",
                    record.task_id,
                    record.branch,
                    record
                        .confidence
                        .map(|c| format!("{:.2}", c))
                        .unwrap_or_else(|| "-".into()),
                    record.diagnostic
                );
            }
            return Ok(0);
        }
        ReviewAction::Accept { id } => (id, ReviewResolution::Accept),
        ReviewAction::Reject { id } => (id, ReviewResolution::Reject),
    };

    let id = TaskId::parse(&id)?;
    let task = merge::resolve_review(&bench.store, bench.isolation.clone(), &id, resolution).await?;
    println!("{}: {}", task.id, task.status);
    Ok(0)
}

/// Parse a task list. TOML files use `[[task]]` tables; JSON files hold
/// either an array of tasks or `{ "task": [...] }`.
fn load_task_list(path: &Path) -> Result<Vec<TaskDescriptor>> {
    let text = std::fs::read_to_string(path)?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    if is_toml {
        return Ok(toml::from_str::<TaskList>(&text)?.tasks);
    }
    match serde_json::from_str::<Vec<TaskDescriptor>>(&text) {
        Ok(tasks) => Ok(tasks),
        Err(_) => Ok(serde_json::from_str::<TaskList>(&text)?.tasks),
    }
}

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter().map(|id| id.as_str()).collect::<Vec<_>>().join(", ")
}

fn print_status(store: &TaskStore) {
    if store.is_empty() {
        println!("No tasks");
        return;
    }
    println!("{:<24} {:<4} {:<13} {:<10} DIAGNOSTIC", "TASK", "PRI", "STATUS", "CONFIDENCE");
    for task in store.tasks() {
        println!(
            "{:<24} {:<4} {:<13} {:<10} {}",
            truncate(task.id.as_str(), 24),
            task.priority,
            task.status.name(),
            task.confidence
                .map(|c| format!("{:.2}", c))
                .unwrap_or_else(|| "-".into()),
            task.diagnostic().unwrap_or("")
        );
    }
    let blocked = store.blocked();
    if !blocked.is_empty() {
        let ids: Vec<TaskId> = blocked.iter().map(|t| t.id.clone()).collect();
        println!("\nBlocked: {}", join_ids(&ids));
    }
}

fn print_summary(summary: &RunSummary) {
    println!();
    if summary.stopped {
        println!("Run stopped");
    }
    println!(
        "Succeeded: {}  Failed: {}  Needs review: {}  Blocked: {}",
        summary.succeeded.len(),
        summary.failed.len(),
        summary.needs_review.len(),
        summary.blocked.len()
    );
    if !summary.blocked.is_empty() {
        println!("Blocked by unmet dependencies: {}", join_ids(&summary.blocked));
    }
}

fn print_recovery(report: &CleanupReport) {
    if report.is_clean() {
        println!("Nothing to recover");
        return;
    }
    println!(
        "Recovered: {} workspace(s) removed, {} task(s) reverted to pending",
        report.removed.len(),
        report.reverted.len()
    );
    for (id, reason) in &report.failed {
        println!("  orphaned {}: {}", id, reason);
    }
    for path in &report.untracked {
        println!("  untracked directory {}", path.display());
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
