//! Per-slot task lifecycle.
//!
//! provision -> execute -> evaluate (with bounded debug retries) -> score
//! -> decide -> integrate or retain -> dispose.
//!
//! The pipeline never writes to the task store. It returns a
//! [`SlotReport`] and the coordinator applies it. The workspace is disposed
//! on every path out of [`run_slot`], including cancellation and failed
//! provisioning; a panic is handled by the coordinator, which disposes by
//! task id.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::executor::{ExecutionRequest, Executor};
use crate::core::task::{Task, TaskId};
use crate::evaluation::{Cascade, DebugRetry, EvaluationRun, RetryDecision, StageInput};
use crate::isolation::{IsolationManager, Workspace};
use crate::merge::{MergeDecision, MergePolicy};
use crate::scoring::{self, ScoreWeights, Signals};
use crate::util::blocking;
use crate::Error;

/// Everything a slot needs, shared by all slots.
pub struct SlotContext {
    pub executor: Arc<dyn Executor>,
    pub cascade: Cascade,
    pub isolation: Arc<IsolationManager>,
    pub weights: ScoreWeights,
    pub policy: MergePolicy,
    /// Bound on each execution call.
    pub task_timeout: Duration,
    pub max_debug_retries: u32,
    pub complexity_budget_lines: usize,
}

/// How a slot finished.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Succeeded,
    NeedsReview(String),
    Failed(String),
    /// Stopped by the global stop signal.
    Cancelled { partially_evaluated: bool },
}

/// Result of one slot run, applied to the store by the coordinator.
#[derive(Debug, Clone)]
pub struct SlotReport {
    pub task_id: TaskId,
    pub verdict: Verdict,
    pub confidence: Option<f64>,
    pub result_ref: Option<String>,
    pub branch: Option<String>,
    pub attempts: u32,
    pub evaluations: Vec<EvaluationRun>,
}

#[derive(Debug, Default)]
struct Progress {
    attempts: u32,
    evaluating: bool,
    evaluations: Vec<EvaluationRun>,
    patch_ref: Option<String>,
    confidence: Option<f64>,
}

/// Outcome of the cancellable part of the pipeline.
enum Decided {
    Integrate,
    NeedsReview(String),
    Failed(String),
}

/// Run one task through its slot.
pub async fn run_slot(ctx: Arc<SlotContext>, task: Task, cancel: CancellationToken) -> SlotReport {
    let id = task.id.clone();
    let mut progress = Progress::default();

    // Provisioning runs to completion even if a stop arrives meanwhile, so
    // a workspace is never created behind the coordinator's back.
    let isolation = ctx.isolation.clone();
    let provision_id = id.clone();
    let workspace = match blocking(move || isolation.provision(&provision_id)).await {
        Ok(workspace) => workspace,
        Err(e) => {
            tracing::warn!(task_id = %id, error = %e, "provisioning failed");
            // A provider crash can leave a registered, half-created workspace.
            let diagnostic = match dispose(&ctx, &id, false).await {
                Some(cleanup) => format!("{}; {}", e, cleanup),
                None => e.to_string(),
            };
            return report(&id, None, progress, Verdict::Failed(diagnostic));
        }
    };

    let decided = if cancel.is_cancelled() {
        None
    } else {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            d = attempt_loop(&ctx, &task, &workspace, &mut progress) => Some(d),
        }
    };

    let verdict = match decided {
        None => {
            tracing::info!(task_id = %id, partially_evaluated = progress.evaluating, "task cancelled");
            dispose(&ctx, &id, false).await;
            Verdict::Cancelled {
                partially_evaluated: progress.evaluating,
            }
        }
        Some(Decided::Failed(diagnostic)) => {
            match dispose(&ctx, &id, false).await {
                Some(e) => Verdict::Failed(format!("{}; {}", diagnostic, e)),
                None => Verdict::Failed(diagnostic),
            }
        }
        Some(Decided::NeedsReview(reason)) => retain(&ctx, &workspace, &progress, reason).await,
        Some(Decided::Integrate) => {
            let isolation = ctx.isolation.clone();
            let ws = workspace.clone();
            match blocking(move || isolation.integrate(&ws)).await {
                Ok(_) => {
                    // Integration cannot be undone; a failed disposal only
                    // leaves an orphan for the sweep.
                    dispose(&ctx, &id, false).await;
                    Verdict::Succeeded
                }
                Err(e) => {
                    tracing::warn!(task_id = %id, error = %e, "integration failed; routing to review");
                    retain(&ctx, &workspace, &progress, e.to_string()).await
                }
            }
        }
    };

    report(&id, Some(&workspace), progress, verdict)
}

async fn attempt_loop(
    ctx: &SlotContext,
    task: &Task,
    workspace: &Workspace,
    progress: &mut Progress,
) -> Decided {
    let mut retry = DebugRetry::new(ctx.max_debug_retries);
    let mut feedback: Option<String> = None;

    loop {
        let attempt = retry.attempt();
        progress.attempts = attempt;
        let request = ExecutionRequest {
            task,
            workspace,
            attempt,
            feedback: feedback.as_deref(),
        };

        let executed =
            match tokio::time::timeout(ctx.task_timeout, ctx.executor.execute(request)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(ctx.task_timeout)),
            };
        let output = match executed {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(task_id = %task.id, attempt, error = %e, "execution failed");
                match retry.record_failure() {
                    RetryDecision::Retry { .. } => {
                        feedback = Some(format!("Execution error: {}", e));
                        continue;
                    }
                    RetryDecision::Exhausted => {
                        return Decided::Failed(format!(
                            "execution failed after {} attempt(s): {}",
                            attempt, e
                        ))
                    }
                }
            }
        };
        progress.patch_ref = Some(output.patch_ref.clone());

        progress.evaluating = true;
        let index = progress.evaluations.len();
        progress.evaluations.push(EvaluationRun::new(attempt));
        let input = StageInput {
            task,
            workspace,
            patch_ref: &output.patch_ref,
            execution: &output,
        };
        ctx.cascade.run(input, &mut progress.evaluations[index]).await;
        let run = &progress.evaluations[index];

        if !run.all_passed() {
            let summary = run
                .failure_summary()
                .unwrap_or_else(|| "evaluation failed".to_string());
            match retry.record_failure() {
                RetryDecision::Retry { attempt: next } => {
                    tracing::info!(task_id = %task.id, next_attempt = next, "debug retry");
                    feedback = Some(summary);
                    continue;
                }
                RetryDecision::Exhausted => {
                    return Decided::Failed(format!(
                        "evaluation failed after {} attempt(s): {}",
                        attempt, summary
                    ))
                }
            }
        }

        let isolation = ctx.isolation.clone();
        let ws = workspace.clone();
        let patch = output.patch_ref.clone();
        let complexity = match blocking(move || isolation.change_size(&ws, &patch)).await {
            Ok(lines) => scoring::complexity_signal(lines, ctx.complexity_budget_lines),
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "could not measure change size");
                0.0
            }
        };
        let signals = Signals {
            acceptance: scoring::acceptance_signal(run),
            review: scoring::review_signal(&output.raw_output, output.self_reported_complete),
            complexity,
        };
        let confidence = scoring::score(&signals, &ctx.weights);
        progress.confidence = Some(confidence);

        let decision = ctx.policy.decide(run, confidence);
        tracing::info!(
            task_id = %task.id,
            confidence,
            threshold = ctx.policy.threshold,
            decision = ?decision,
            "merge decision"
        );
        return match decision {
            MergeDecision::Integrate => Decided::Integrate,
            MergeDecision::NeedsReview { reason } => Decided::NeedsReview(reason),
        };
    }
}

/// Dispose the task's workspace; returns the error text if it failed.
async fn dispose(ctx: &SlotContext, id: &TaskId, keep_branch: bool) -> Option<String> {
    let isolation = ctx.isolation.clone();
    let id = id.clone();
    match blocking(move || isolation.dispose(&id, keep_branch)).await {
        Ok(_) => None,
        Err(e) => Some(e.to_string()),
    }
}

/// Dispose the directory but keep the branch for review.
async fn retain(ctx: &SlotContext, workspace: &Workspace, progress: &Progress, reason: String) -> Verdict {
    let isolation = ctx.isolation.clone();
    let ws = workspace.clone();
    let patch = progress.patch_ref.clone();
    let confidence = progress.confidence;
    let diagnostic = reason.clone();
    let retained = blocking(move || {
        isolation.retain_for_review(&ws, patch.as_deref(), confidence, &diagnostic)
    })
    .await;
    match retained {
        Ok(_) => Verdict::NeedsReview(reason),
        Err(e) => {
            tracing::error!(task_id = %workspace.task_id, error = %e, "could not retain branch for review");
            Verdict::Failed(format!("{}; {}", reason, e))
        }
    }
}

fn report(id: &TaskId, workspace: Option<&Workspace>, progress: Progress, verdict: Verdict) -> SlotReport {
    SlotReport {
        task_id: id.clone(),
        verdict,
        confidence: progress.confidence,
        result_ref: progress.patch_ref,
        branch: workspace.map(|w| w.branch.clone()),
        attempts: progress.attempts,
        evaluations: progress.evaluations,
    }
}
