//! End-to-end tests against a real git repository.
//!
//! These tests use git worktree isolation so every task gets its own
//! branch and checkout, and confident patches land on the target branch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::RwLock;

use conductor::core::{TaskDescriptor, TaskStatus};
use conductor::evaluation::Cascade;
use conductor::isolation::{GitWorktreeIsolation, IsolationManager};
use conductor::merge::{resolve_review, MergePolicy, ReviewResolution};
use conductor::notify::LogNotifier;
use conductor::orchestration::SlotContext;
use conductor::scoring::ScoreWeights;
use conductor::state::{SharedStore, TaskStore, WorkspaceRegistry};
use conductor::Orchestrator;

use crate::fixtures::{id, task, FileWritingExecutor, TestRepo};

struct GitRun {
    repo: TestRepo,
    _worktrees: TempDir,
    target: String,
    store: SharedStore,
    isolation: Arc<IsolationManager>,
    orchestrator: Orchestrator,
}

fn git_run(tasks: Vec<TaskDescriptor>, files: &[(&str, &str)], concurrency: usize) -> GitRun {
    let repo = TestRepo::new();
    let worktrees = TempDir::new().unwrap();
    let target = repo.current_branch();

    let mut store = TaskStore::in_memory();
    store.add_batch(tasks).unwrap();
    let store: SharedStore = Arc::new(RwLock::new(store));

    let provider = Arc::new(GitWorktreeIsolation::new(&repo.path, &target).unwrap());
    let isolation = Arc::new(IsolationManager::new(
        provider,
        WorkspaceRegistry::in_memory(),
        worktrees.path(),
        "conductor/task/",
        &target,
    ));
    let executor = FileWritingExecutor {
        files: files
            .iter()
            .map(|(task, file)| (task.to_string(), file.to_string()))
            .collect::<HashMap<_, _>>(),
        delay: Duration::from_millis(200),
    };
    let ctx = SlotContext {
        executor: Arc::new(executor),
        cascade: Cascade::new(Duration::from_secs(30)),
        isolation: isolation.clone(),
        weights: ScoreWeights::default(),
        policy: MergePolicy::default(),
        task_timeout: Duration::from_secs(30),
        max_debug_retries: 0,
        complexity_budget_lines: 400,
    };
    let orchestrator =
        Orchestrator::new(store.clone(), ctx, concurrency, Arc::new(LogNotifier)).unwrap();

    GitRun {
        repo,
        _worktrees: worktrees,
        target,
        store,
        isolation,
        orchestrator,
    }
}

/// Test: Parallel tasks land on the target branch
/// Given two independent tasks and a third depending on both
/// When the run completes
/// Then all three files are on the target branch and no task branch is
/// left behind
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_and_dependent_tasks_integrate() {
    let mut run = git_run(
        vec![
            task("alpha"),
            task("beta"),
            task("gamma").with_dependencies(&["alpha", "beta"]),
        ],
        &[],
        2,
    );

    let summary = run.orchestrator.run().await.unwrap();
    assert_eq!(summary.succeeded.len(), 3, "summary: {:?}", summary);
    assert_eq!(summary.succeeded[2], id("gamma"));

    for name in ["alpha", "beta", "gamma"] {
        let file = format!("{}.txt", name);
        assert_eq!(
            run.repo.show(&run.target, &file).as_deref(),
            Some(format!("written by {}\n", name).as_str())
        );
        assert!(!run.repo.branch_exists(&format!("conductor/task/{}", name)));
        let task = run.store.read().await.get(&id(name)).cloned().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert!(task.confidence.unwrap() >= 0.85);
    }
    // The working tree of the target branch was updated too.
    assert!(run.repo.path.join("gamma.txt").exists());
    assert_eq!(run.isolation.active_count().unwrap(), 0);
}

/// Test: Conflicting patches
/// Given two tasks running in parallel that both create the same file
/// When the run completes
/// Then one is integrated and the other waits in review with its branch
/// kept; rejecting it deletes the branch
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_conflicting_tasks_route_one_to_review() {
    let mut run = git_run(
        vec![task("left"), task("right")],
        &[("left", "shared.txt"), ("right", "shared.txt")],
        2,
    );

    let summary = run.orchestrator.run().await.unwrap();
    assert_eq!(summary.succeeded.len(), 1, "summary: {:?}", summary);
    assert_eq!(summary.needs_review.len(), 1, "summary: {:?}", summary);

    let winner = summary.succeeded[0].to_string();
    let loser = summary.needs_review[0].clone();
    assert_eq!(
        run.repo.show(&run.target, "shared.txt").as_deref(),
        Some(format!("written by {}\n", winner).as_str())
    );

    let branch = format!("conductor/task/{}", loser);
    assert!(run.repo.branch_exists(&branch));
    let task = run.store.read().await.get(&loser).cloned().unwrap();
    assert!(task.diagnostic().unwrap().contains("conflict"));

    let rejected = resolve_review(
        &run.store,
        run.isolation.clone(),
        &loser,
        ReviewResolution::Reject,
    )
    .await
    .unwrap();
    assert!(matches!(rejected.status, TaskStatus::Failed { .. }));
    assert!(!run.repo.branch_exists(&branch));
    assert!(run.isolation.reviews().unwrap().is_empty());
}

/// Test: Existing branch or directory is never touched
/// Given a branch and a directory that already sit where two tasks'
/// workspaces would go
/// When both tasks are provisioned
/// Then provisioning is refused and the branch and directory survive
#[tokio::test]
async fn test_refused_provision_keeps_existing_state() {
    let run = git_run(vec![task("a"), task("b")], &[], 1);
    run.repo.create_branch("conductor/task/a");
    let occupied = run.isolation.root().join("b");
    std::fs::create_dir_all(&occupied).unwrap();
    std::fs::write(occupied.join("precious.txt"), "keep me\n").unwrap();

    for name in ["a", "b"] {
        let err = run.isolation.provision(&id(name)).unwrap_err();
        assert!(err.to_string().contains("already exists"), "{}", err);
    }

    assert!(run.repo.branch_exists("conductor/task/a"));
    assert!(occupied.join("precious.txt").exists());
    assert!(!run.repo.branch_exists("conductor/task/b"));
    assert_eq!(run.isolation.active_count().unwrap(), 0);
}
