//! Merge controller.
//!
//! Decides whether a verified task is integrated automatically or routed
//! to human review, and applies the human decision afterwards.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::evaluation::EvaluationRun;
use crate::isolation::IsolationManager;
use crate::state::SharedStore;
use crate::util::blocking;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergePolicy {
    /// Minimum score for automatic integration, inclusive.
    pub threshold: f64,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self { threshold: 0.85 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeDecision {
    Integrate,
    NeedsReview { reason: String },
}

impl MergePolicy {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(Error::Validation(format!(
                "merge threshold must be within [0, 1], got {}",
                self.threshold
            )));
        }
        Ok(())
    }

    /// Integrate iff every stage passed and `score >= threshold`.
    pub fn decide(&self, run: &EvaluationRun, score: f64) -> MergeDecision {
        if !run.all_passed() {
            return MergeDecision::NeedsReview {
                reason: run
                    .failure_summary()
                    .unwrap_or_else(|| "evaluation did not complete".to_string()),
            };
        }
        if score >= self.threshold {
            MergeDecision::Integrate
        } else {
            MergeDecision::NeedsReview {
                reason: format!(
                    "confidence {:.3} below threshold {:.3}",
                    score, self.threshold
                ),
            }
        }
    }
}

/// Human decision on a task waiting in review.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewResolution {
    Accept,
    Reject,
}

/// Apply a review decision.
///
/// Accepting integrates the retained branch and marks the task
/// `succeeded`; rejecting deletes the branch and marks it `failed`. If
/// integration fails the task stays in review.
pub async fn resolve_review(
    store: &SharedStore,
    isolation: Arc<IsolationManager>,
    id: &TaskId,
    resolution: ReviewResolution,
) -> Result<Task> {
    {
        let guard = store.read().await;
        let task = guard.get(id).ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        if !matches!(task.status, TaskStatus::NeedsReview { .. }) {
            return Err(Error::Validation(format!(
                "task {} is {}, not awaiting review",
                id,
                task.status.name()
            )));
        }
    }

    let task_id = id.clone();
    match resolution {
        ReviewResolution::Accept => {
            let commit = blocking(move || isolation.integrate_retained(&task_id)).await?;
            let task = store.write().await.update(id, |task| {
                task.resolve_review(true, "")?;
                task.result_ref = Some(commit);
                Ok(())
            })?;
            tracing::info!(task_id = %id, "review accepted");
            Ok(task)
        }
        ReviewResolution::Reject => {
            blocking(move || isolation.discard_retained(&task_id)).await?;
            let task = store
                .write()
                .await
                .update(id, |task| task.resolve_review(false, "rejected in review"))?;
            tracing::info!(task_id = %id, "review rejected");
            Ok(task)
        }
    }
}
