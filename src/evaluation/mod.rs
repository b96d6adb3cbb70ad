//! Evaluation cascade.
//!
//! A cascade is an ordered list of verification stages run against the
//! patch a task produced. Stages run strictly in order and the first
//! failure stops the cascade; stages after it are recorded as not run.
//! Every outcome is kept on the task for auditability.

mod retry;
pub mod stages;

pub use retry::{DebugRetry, RetryDecision};
pub use stages::{AcceptanceStage, CommandStage, CompletionStage};

use crate::core::task::Task;
use crate::error::{Error, Result};
use crate::isolation::Workspace;
use crate::orchestration::ExecutionOutput;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Everything a stage may look at.
#[derive(Debug, Clone, Copy)]
pub struct StageInput<'a> {
    pub task: &'a Task,
    pub workspace: &'a Workspace,
    pub patch_ref: &'a str,
    pub execution: &'a ExecutionOutput,
}

/// What a stage reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub passed: bool,
    /// Cost of the stage as measured by the stage itself.
    pub duration_ms: Option<u64>,
    pub diagnostic: Option<String>,
    /// Optional acceptance signal in [0.0, 1.0] for the confidence scorer.
    pub signal: Option<f64>,
}

impl StageReport {
    pub fn pass() -> Self {
        Self {
            passed: true,
            duration_ms: None,
            diagnostic: None,
            signal: None,
        }
    }

    pub fn fail(diagnostic: impl Into<String>) -> Self {
        Self {
            passed: false,
            duration_ms: None,
            diagnostic: Some(diagnostic.into()),
            signal: None,
        }
    }

    pub fn with_signal(mut self, signal: f64) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// A single verification stage.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// Verify the patch. An `Err` is recorded as a failed stage.
    async fn run(&self, input: StageInput<'_>) -> Result<StageReport>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Passed,
    Failed,
    NotRun,
}

/// Recorded result of one stage in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: String,
    pub status: StageStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<f64>,
}

impl StageOutcome {
    fn not_run(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            status: StageStatus::NotRun,
            duration_ms: 0,
            diagnostic: None,
            signal: None,
        }
    }
}

/// One full pass of the cascade. A new run never merges with an old one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRun {
    /// Execution attempt this run evaluated, starting at 1.
    pub attempt: u32,
    pub outcomes: Vec<StageOutcome>,
    pub started_at: DateTime<Utc>,
}

impl EvaluationRun {
    pub fn new(attempt: u32) -> Self {
        Self {
            attempt,
            outcomes: Vec::new(),
            started_at: Utc::now(),
        }
    }

    pub fn all_passed(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| o.status == StageStatus::Passed)
    }

    pub fn first_failure(&self) -> Option<&StageOutcome> {
        self.outcomes
            .iter()
            .find(|o| o.status == StageStatus::Failed)
    }

    pub fn passed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == StageStatus::Passed)
            .count()
    }

    /// Diagnostic text handed back to the collaborator on a debug retry.
    pub fn failure_summary(&self) -> Option<String> {
        self.first_failure().map(|o| match &o.diagnostic {
            Some(diag) => format!("Stage '{}' failed: {}", o.stage, diag),
            None => format!("Stage '{}' failed", o.stage),
        })
    }
}

/// Ordered, fail-fast list of stages.
#[derive(Clone)]
pub struct Cascade {
    stages: Vec<Arc<dyn Stage>>,
    stage_timeout: Duration,
}

impl Cascade {
    pub fn new(stage_timeout: Duration) -> Self {
        Self {
            stages: Vec::new(),
            stage_timeout,
        }
    }

    pub fn with_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn push(&mut self, stage: Arc<dyn Stage>) {
        self.stages.push(stage);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run every stage in order, stopping at the first failure.
    ///
    /// Stage errors and stage timeouts count as failures; the cascade
    /// itself never errors. `run` is appended to as each stage finishes.
    pub async fn run(&self, input: StageInput<'_>, run: &mut EvaluationRun) {
        let mut failed = false;

        for stage in &self.stages {
            if failed {
                run.outcomes.push(StageOutcome::not_run(stage.name()));
                continue;
            }

            let started = Instant::now();
            let result = tokio::time::timeout(self.stage_timeout, stage.run(input)).await;
            let elapsed = started.elapsed().as_millis() as u64;

            let outcome = match result {
                Ok(Ok(report)) => StageOutcome {
                    stage: stage.name().to_string(),
                    status: if report.passed {
                        StageStatus::Passed
                    } else {
                        StageStatus::Failed
                    },
                    duration_ms: report.duration_ms.unwrap_or(elapsed),
                    diagnostic: report.diagnostic,
                    signal: report.signal,
                },
                Ok(Err(e)) => StageOutcome {
                    stage: stage.name().to_string(),
                    status: StageStatus::Failed,
                    duration_ms: elapsed,
                    diagnostic: Some(e.to_string()),
                    signal: None,
                },
                Err(_) => StageOutcome {
                    stage: stage.name().to_string(),
                    status: StageStatus::Failed,
                    duration_ms: elapsed,
                    diagnostic: Some(Error::Timeout(self.stage_timeout).to_string()),
                    signal: None,
                },
            };

            tracing::debug!(
                task_id = %input.task.id,
                stage = %outcome.stage,
                status = ?outcome.status,
                duration_ms = outcome.duration_ms,
                "stage finished"
            );

            if outcome.status == StageStatus::Failed {
                tracing::warn!(
                    task_id = %input.task.id,
                    stage = %outcome.stage,
                    diagnostic = outcome.diagnostic.as_deref().unwrap_or(""),
                    "stage failed"
                );
                failed = true;
            }
            run.outcomes.push(outcome);
        }
    }
}

impl std::fmt::Debug for Cascade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cascade")
            .field("stages", &self.stage_names())
            .field("stage_timeout", &self.stage_timeout)
            .finish()
    }
}
