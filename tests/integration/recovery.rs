//! Crash recovery tests.
//!
//! These tests simulate a process that died mid-run and verify that the
//! next start reconciles the registry and the store before scheduling.

use std::path::PathBuf;

use tempfile::TempDir;
use uuid::Uuid;

use conductor::cleanup::recover;
use conductor::core::TaskStatus;
use conductor::isolation::Workspace;
use conductor::state::{TaskStore, WorkspaceRegistry, REGISTRY_FILE, STORE_FILE};

use crate::fixtures::{id, task, Harness, Options, Step};

fn leftover(name: &str) -> Workspace {
    Workspace {
        task_id: id(name),
        branch: format!("conductor/task/{}", name),
        path: PathBuf::from("/tmp/conductor-integration").join(name),
        base_commit: Some("base".into()),
    }
}

/// Test: Recovery after a crash
/// Given a store with a task stuck in running and a workspace left
/// registered by a previous run
/// When recovery runs and the orchestrator starts
/// Then the workspace is disposed, the task reverted, and it then
/// completes normally
#[tokio::test]
async fn test_recover_then_resume() {
    let dir = TempDir::new().unwrap();
    let store_path = dir.path().join(STORE_FILE);
    let registry_path = dir.path().join(REGISTRY_FILE);

    {
        let mut store = TaskStore::open(&store_path).unwrap();
        store.add_batch(vec![task("interrupted"), task("untouched")]).unwrap();
        store.mark_running(&id("interrupted")).unwrap();

        let mut registry = WorkspaceRegistry::open(&registry_path).unwrap();
        let workspace = leftover("interrupted");
        registry.register(workspace.clone(), Uuid::new_v4()).unwrap();
        registry.activate(&workspace).unwrap();
    }

    let store = TaskStore::open(&store_path).unwrap();
    assert_eq!(store.running_count(), 1);
    let registry = WorkspaceRegistry::open(&registry_path).unwrap();
    assert_eq!(registry.len(), 1);

    let mut harness = Harness::with_store(Options::default(), store, registry);
    let report = recover(&harness.store, harness.isolation.clone()).await.unwrap();
    assert_eq!(report.removed, vec![id("interrupted")]);
    assert_eq!(report.reverted, vec![id("interrupted")]);
    assert!(report.is_success());
    assert_eq!(harness.provider.destroys("interrupted"), 1);
    assert_eq!(harness.isolation.active_count().unwrap(), 0);
    assert_eq!(harness.task("interrupted").await.status, TaskStatus::Pending);

    let summary = harness.run().await.unwrap();
    assert_eq!(summary.succeeded.len(), 2);
    assert_eq!(harness.provider.creates("interrupted"), 1);
    assert_eq!(harness.provider.destroys("interrupted"), 2);

    // A second pass has nothing left to do.
    let again = recover(&harness.store, harness.isolation.clone()).await.unwrap();
    assert!(again.removed.is_empty());
    assert!(again.reverted.is_empty());
    assert!(WorkspaceRegistry::open(&registry_path).unwrap().is_empty());
}

/// Test: Outcomes survive a restart
/// Given a file-backed store
/// When a run finishes with mixed outcomes and the store is reopened
/// Then every status, diagnostic and evaluation history is preserved
#[tokio::test]
async fn test_outcomes_persist_across_reopen() {
    let dir = TempDir::new().unwrap();
    let store_path = dir.path().join(STORE_FILE);

    let mut store = TaskStore::open(&store_path).unwrap();
    store
        .add_batch(vec![
            task("good"),
            task("bad"),
            task("after-bad").with_dependencies(&["bad"]),
        ])
        .unwrap();

    let mut harness = Harness::with_store(Options::default(), store, WorkspaceRegistry::in_memory());
    harness.executor.script("bad", vec![Step::Fail("segfault".into())]);
    let summary = harness.run().await.unwrap();
    assert_eq!(summary.blocked, vec![id("after-bad")]);

    let reopened = TaskStore::open(&store_path).unwrap();
    let good = reopened.get(&id("good")).unwrap();
    assert_eq!(good.status, TaskStatus::Succeeded);
    assert_eq!(good.evaluations.len(), 1);
    assert_eq!(good.confidence, Some(1.0));
    assert_eq!(good.result_ref.as_deref(), Some("patch-good-1"));

    let bad = reopened.get(&id("bad")).unwrap();
    assert!(bad.diagnostic().unwrap().contains("segfault"));
    assert_eq!(
        reopened.get(&id("after-bad")).unwrap().status,
        TaskStatus::Pending
    );
    assert_eq!(reopened.blocked().len(), 1);
}
