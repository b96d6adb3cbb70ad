//! Fault handling tests.
//!
//! These tests verify that crashes, timeouts and failed evaluations are
//! contained to their own slot, always dispose the workspace, and use
//! the debug-retry budget as configured.

use std::time::Duration;

use conductor::core::TaskStatus;
use conductor::evaluation::StageStatus;

use crate::fixtures::{id, task, Harness, Options, Step};

/// Test: Executor crash
/// Given one task whose execution panics and one healthy sibling
/// When the run completes
/// Then the crashed task is failed, its workspace is disposed exactly
/// once, and the sibling is unaffected
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_executor_panic_fails_task_and_disposes_once() {
    let mut harness = Harness::new(Options::default(), vec![task("boom"), task("fine")]);
    harness.executor.script("boom", vec![Step::Panic]);

    let summary = harness.run().await.unwrap();
    assert_eq!(summary.failed, vec![id("boom")]);
    assert_eq!(summary.succeeded, vec![id("fine")]);

    let boom = harness.task("boom").await;
    assert!(boom.diagnostic().unwrap().contains("executor crashed"));
    assert_eq!(harness.provider.creates("boom"), 1);
    assert_eq!(harness.provider.destroys("boom"), 1);
    assert_eq!(harness.provider.destroys("fine"), 1);
    assert_eq!(harness.isolation.active_count().unwrap(), 0);
}

/// Test: Execution timeout
/// Given a task whose execution never returns and a budget of 1 retry
/// When the task timeout elapses on both attempts
/// Then it is failed with a timeout diagnostic and its workspace disposed
#[tokio::test]
async fn test_execution_timeout_exhausts_budget() {
    let mut harness = Harness::new(
        Options {
            task_timeout: Duration::from_millis(100),
            max_debug_retries: 1,
            ..Options::default()
        },
        vec![task("stuck")],
    );
    harness.executor.script("stuck", vec![Step::Hang, Step::Hang]);

    let summary = harness.run().await.unwrap();
    assert_eq!(summary.failed, vec![id("stuck")]);
    let stuck = harness.task("stuck").await;
    let diagnostic = stuck.diagnostic().unwrap();
    assert!(diagnostic.contains("timed out"), "{}", diagnostic);
    assert!(diagnostic.contains("after 2 attempt(s)"), "{}", diagnostic);
    assert_eq!(harness.executor.calls_for("stuck").len(), 2);
    assert_eq!(harness.executor.in_flight(), 0);
    assert_eq!(harness.provider.creates("stuck"), 1);
    assert_eq!(harness.provider.destroys("stuck"), 1);
}

/// Test: Timed-out execution is retried
/// Given an execution that hangs once
/// When the task runs with a retry budget of 1
/// Then the second attempt succeeds and saw the timeout as feedback
#[tokio::test]
async fn test_execution_timeout_retried() {
    let mut harness = Harness::new(
        Options {
            task_timeout: Duration::from_millis(100),
            max_debug_retries: 1,
            ..Options::default()
        },
        vec![task("slow")],
    );
    harness.executor.script("slow", vec![Step::Hang, Step::Complete]);

    let summary = harness.run().await.unwrap();
    assert_eq!(summary.succeeded, vec![id("slow")]);
    let calls = harness.executor.calls_for("slow");
    assert_eq!(calls.len(), 2);
    assert!(calls[1].feedback.as_deref().unwrap().contains("timed out"));
    assert_eq!(harness.task("slow").await.attempts, 2);
}

/// Test: Debug retry
/// Given a stage that rejects the first patch
/// When the task runs with a retry budget of 2
/// Then it succeeds on attempt 2 and the retry saw the diagnostics
#[tokio::test]
async fn test_debug_retry_succeeds_on_second_attempt() {
    let mut harness = Harness::new(
        Options {
            max_debug_retries: 2,
            ..Options::default()
        },
        vec![task("flaky")],
    );
    harness.stage("checks").fail_times("flaky", 1);

    let summary = harness.run().await.unwrap();
    assert_eq!(summary.succeeded, vec![id("flaky")]);

    let calls = harness.executor.calls_for("flaky");
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].attempt, 1);
    assert!(calls[0].feedback.is_none());
    assert_eq!(calls[1].attempt, 2);
    assert!(calls[1].feedback.as_deref().unwrap().contains("checks rejected the patch"));

    let flaky = harness.task("flaky").await;
    assert_eq!(flaky.attempts, 2);
    assert_eq!(flaky.evaluations.len(), 2);
    assert!(!flaky.evaluations[0].all_passed());
    assert!(flaky.evaluations[1].all_passed());
    assert_eq!(flaky.result_ref.as_deref(), Some("patch-flaky-2"));
    assert_eq!(harness.provider.creates("flaky"), 1, "retries reuse the workspace");
}

/// Test: Retry budget exhausted
/// Given a stage that always fails and a budget of 1 retry
/// When the task runs
/// Then it is failed after two executions
#[tokio::test]
async fn test_retry_budget_exhausted() {
    let mut harness = Harness::new(
        Options {
            max_debug_retries: 1,
            ..Options::default()
        },
        vec![task("hopeless")],
    );
    harness.stage("checks").fail_times("hopeless", 10);

    let summary = harness.run().await.unwrap();
    assert_eq!(summary.failed, vec![id("hopeless")]);
    let hopeless = harness.task("hopeless").await;
    assert!(matches!(hopeless.status, TaskStatus::Failed { .. }));
    assert!(hopeless.diagnostic().unwrap().contains("after 2 attempt(s)"));
    assert_eq!(hopeless.evaluations.len(), 2);
    assert_eq!(harness.executor.calls_for("hopeless").len(), 2);
    assert!(harness.provider.integrated().is_empty());
}

/// Test: Execution error is retried
/// Given an execution that errors once
/// When the task runs with a retry budget of 1
/// Then the second attempt succeeds and saw the error as feedback
#[tokio::test]
async fn test_execution_error_retried() {
    let mut harness = Harness::new(
        Options {
            max_debug_retries: 1,
            ..Options::default()
        },
        vec![task("net")],
    );
    harness
        .executor
        .script("net", vec![Step::Fail("connection reset".into()), Step::Complete]);

    let summary = harness.run().await.unwrap();
    assert_eq!(summary.succeeded, vec![id("net")]);
    let calls = harness.executor.calls_for("net");
    assert!(calls[1].feedback.as_deref().unwrap().contains("connection reset"));
    // Only the successful execution was evaluated.
    assert_eq!(harness.task("net").await.evaluations.len(), 1);
}

/// Test: Fail-fast cascade
/// Given stages lint, unit, e2e where unit fails
/// When the task is evaluated
/// Then e2e never runs and is recorded as not run
#[tokio::test]
async fn test_cascade_stops_at_first_failure() {
    let mut harness = Harness::new(
        Options {
            stages: vec!["lint", "unit", "e2e"],
            ..Options::default()
        },
        vec![task("api")],
    );
    harness.stage("unit").fail_times("api", 1);

    harness.run().await.unwrap();
    let api = harness.task("api").await;
    let statuses: Vec<StageStatus> = api.evaluations[0].outcomes.iter().map(|o| o.status).collect();
    assert_eq!(
        statuses,
        vec![StageStatus::Passed, StageStatus::Failed, StageStatus::NotRun]
    );
    assert_eq!(harness.stage("e2e").runs(), 0);
    assert!(api.diagnostic().unwrap().contains("Stage 'unit' failed"));
}

/// Test: Incomplete execution
/// Given an executor that does not report completion nor a confidence line
/// When the task is scored with half its weight on review
/// Then the review signal is zero and the task waits for review
#[tokio::test]
async fn test_incomplete_execution_never_integrates() {
    let mut harness = Harness::new(
        Options {
            weights: conductor::scoring::ScoreWeights {
                acceptance: 0.5,
                review: 0.5,
                complexity: 0.0,
            },
            ..Options::default()
        },
        vec![task("half")],
    );
    harness.executor.script("half", vec![Step::Incomplete]);

    let summary = harness.run().await.unwrap();
    // Raw output has no confidence line, so the review signal is zero.
    assert_eq!(summary.needs_review, vec![id("half")]);
    assert_eq!(harness.task("half").await.confidence, Some(0.5));
    assert!(harness.provider.integrated().is_empty());
}

/// Test: Provisioning failure
/// Given a workspace that cannot be created
/// When the task is dispatched
/// Then it fails with the provisioning diagnostic and never executes
#[tokio::test]
async fn test_provisioning_failure_fails_task() {
    let mut harness = Harness::new(Options::default(), vec![task("locked"), task("ok")]);
    harness.provider.refuse_create("locked");

    let summary = harness.run().await.unwrap();
    assert_eq!(summary.failed, vec![id("locked")]);
    assert_eq!(summary.succeeded, vec![id("ok")]);
    let locked = harness.task("locked").await;
    assert!(locked.diagnostic().unwrap().contains("repository is locked"));
    assert!(harness.executor.calls_for("locked").is_empty());
    assert_eq!(harness.isolation.active_count().unwrap(), 0);
}

/// Test: Provider crash while provisioning
/// Given a provider that panics halfway through creating a workspace
/// When the task is dispatched
/// Then it fails, the half-created workspace is destroyed, and nothing
/// stays registered
#[tokio::test]
async fn test_provisioning_crash_disposes_workspace() {
    let mut harness = Harness::new(Options::default(), vec![task("boom"), task("ok")]);
    harness.provider.crash_create("boom");

    let summary = harness.run().await.unwrap();
    assert_eq!(summary.failed, vec![id("boom")]);
    assert_eq!(summary.succeeded, vec![id("ok")]);
    let boom = harness.task("boom").await;
    assert!(boom.diagnostic().unwrap().contains("provider crashed mid-create"));
    assert!(harness.executor.calls_for("boom").is_empty());
    assert_eq!(harness.provider.destroys("boom"), 1);
    assert_eq!(harness.isolation.active_count().unwrap(), 0);
}
