//! Task data model for the backlog.
//!
//! Tasks are the atomic units of work handed to the execution
//! collaborator. Each task tracks its priority, dependency edges,
//! acceptance criteria, lifecycle status and evaluation history.

use crate::error::{Error, Result};
use crate::evaluation::EvaluationRun;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Longest identifier accepted at intake.
pub const MAX_TASK_ID_LEN: usize = 100;

fn task_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("task id pattern is valid")
    })
}

/// Unique, stable identifier for a task.
///
/// Identifiers are restricted to characters that are valid in both a git
/// branch name and a directory name, so the workspace naming derived from
/// them is injective.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(String);

impl TaskId {
    /// Parse and validate an identifier.
    pub fn parse(s: &str) -> Result<Self> {
        let valid = !s.is_empty()
            && s.len() <= MAX_TASK_ID_LEN
            && task_id_pattern().is_match(s)
            && !s.contains("..")
            && !s.ends_with(".lock")
            && !s.ends_with('.');
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(Error::InvalidTaskId(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TaskId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Priority tier. `P0` is the most urgent.
///
/// The ordering is by urgency: `P0 > P1 > P2 > P3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Priority {
    P0,
    P1,
    #[default]
    P2,
    P3,
}

impl Priority {
    /// Numeric tier, 0 for the most urgent.
    pub fn tier(&self) -> u8 {
        match self {
            Priority::P0 => 0,
            Priority::P1 => 1,
            Priority::P2 => 2,
            Priority::P3 => 3,
        }
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.tier().cmp(&self.tier())
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "P{}", self.tier())
    }
}

/// Task status in its lifecycle.
///
/// `pending -> running -> {succeeded, failed, needs_review}`. A running
/// task may also revert to pending when processing is stopped before it
/// was evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Waiting for dispatch (possibly blocked on dependencies).
    #[default]
    Pending,
    /// Assigned to an execution slot.
    Running,
    /// Verified and integrated.
    Succeeded,
    /// Finalized as failed.
    Failed {
        /// Why the task failed.
        diagnostic: String,
    },
    /// Verified but not confident enough to integrate automatically.
    NeedsReview {
        /// Why the task was routed to review.
        diagnostic: String,
    },
}

impl TaskStatus {
    /// Short state name without the diagnostic.
    pub fn name(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::NeedsReview { .. } => "needs_review",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed { .. } | TaskStatus::NeedsReview { .. }
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Failed { diagnostic } => write!(f, "failed: {}", diagnostic),
            TaskStatus::NeedsReview { diagnostic } => write!(f, "needs_review: {}", diagnostic),
            other => f.write_str(other.name()),
        }
    }
}

/// Intake format for a task, as produced by an external intake process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl TaskDescriptor {
    pub fn new(id: &str, description: &str) -> Self {
        Self {
            id: id.to_string(),
            description: description.to_string(),
            priority: Priority::default(),
            dependencies: Vec::new(),
            acceptance_criteria: Vec::new(),
            status: TaskStatus::Pending,
            created_at: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_criteria(mut self, criteria: &[&str]) -> Self {
        self.acceptance_criteria = criteria.iter().map(|c| c.to_string()).collect();
        self
    }
}

/// Wrapper used when a task list is read from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskList {
    #[serde(default, rename = "task")]
    pub tasks: Vec<TaskDescriptor>,
}

/// A single task in the backlog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// What the task should accomplish.
    pub description: String,
    pub priority: Priority,
    /// Tasks that must succeed before this one may run, deduplicated.
    pub dependencies: Vec<TaskId>,
    /// Ordered, machine-checkable acceptance criteria.
    pub acceptance_criteria: Vec<String>,
    pub status: TaskStatus,
    /// Confidence score in [0.0, 1.0] once evaluated.
    pub confidence: Option<f64>,
    /// Patch reference (commit id) produced by the last execution.
    pub result_ref: Option<String>,
    /// Branch the task's work lives on.
    pub branch_name: Option<String>,
    /// Execution attempts consumed, including debug retries.
    #[serde(default)]
    pub attempts: u32,
    /// Every evaluation run, oldest first.
    #[serde(default)]
    pub evaluations: Vec<EvaluationRun>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task with no dependencies.
    pub fn new(id: TaskId, description: &str) -> Self {
        Self {
            id,
            description: description.to_string(),
            priority: Priority::default(),
            dependencies: Vec::new(),
            acceptance_criteria: Vec::new(),
            status: TaskStatus::Pending,
            confidence: None,
            result_ref: None,
            branch_name: None,
            attempts: 0,
            evaluations: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Build a task from an intake descriptor.
    ///
    /// Validates the identifiers and rejects self-dependencies and tasks
    /// that claim to be running already. Dependency existence and cycles
    /// are checked by the store against the whole graph.
    pub fn from_descriptor(descriptor: TaskDescriptor) -> Result<Self> {
        let id = TaskId::parse(&descriptor.id)?;
        if descriptor.status == TaskStatus::Running {
            return Err(Error::Validation(format!(
                "Task {} cannot be submitted as running",
                id
            )));
        }

        let mut dependencies: Vec<TaskId> = Vec::with_capacity(descriptor.dependencies.len());
        for raw in &descriptor.dependencies {
            let dep = TaskId::parse(raw)?;
            if dep == id {
                return Err(Error::Validation(format!("Task {} depends on itself", id)));
            }
            if !dependencies.contains(&dep) {
                dependencies.push(dep);
            }
        }

        let mut task = Task::new(id, &descriptor.description);
        task.priority = descriptor.priority;
        task.dependencies = dependencies;
        task.acceptance_criteria = descriptor.acceptance_criteria;
        task.status = descriptor.status;
        if let Some(created_at) = descriptor.created_at {
            task.created_at = created_at;
        }
        Ok(task)
    }

    fn transition_error(&self, to: &str) -> Error {
        Error::InvalidTransition {
            task: self.id.clone(),
            from: self.status.name().to_string(),
            to: to.to_string(),
        }
    }

    /// `pending -> running`. Happens exactly once per dispatch.
    pub fn start(&mut self) -> Result<()> {
        if self.status != TaskStatus::Pending {
            return Err(self.transition_error("running"));
        }
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// `running -> succeeded`.
    pub fn succeed(&mut self) -> Result<()> {
        if self.status != TaskStatus::Running {
            return Err(self.transition_error("succeeded"));
        }
        self.status = TaskStatus::Succeeded;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// `running -> failed`.
    pub fn fail(&mut self, diagnostic: &str) -> Result<()> {
        if self.status != TaskStatus::Running {
            return Err(self.transition_error("failed"));
        }
        self.status = TaskStatus::Failed {
            diagnostic: diagnostic.to_string(),
        };
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// `running -> needs_review`.
    pub fn needs_review(&mut self, diagnostic: &str) -> Result<()> {
        if self.status != TaskStatus::Running {
            return Err(self.transition_error("needs_review"));
        }
        self.status = TaskStatus::NeedsReview {
            diagnostic: diagnostic.to_string(),
        };
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// `running -> pending`, used when processing stops before evaluation.
    pub fn revert_to_pending(&mut self) -> Result<()> {
        if self.status != TaskStatus::Running {
            return Err(self.transition_error("pending"));
        }
        self.status = TaskStatus::Pending;
        self.started_at = None;
        Ok(())
    }

    /// Resolve a `needs_review` task after human review.
    pub fn resolve_review(&mut self, accepted: bool, diagnostic: &str) -> Result<()> {
        if !matches!(self.status, TaskStatus::NeedsReview { .. }) {
            let to = if accepted { "succeeded" } else { "failed" };
            return Err(self.transition_error(to));
        }
        self.status = if accepted {
            TaskStatus::Succeeded
        } else {
            TaskStatus::Failed {
                diagnostic: diagnostic.to_string(),
            }
        };
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Human-readable reason attached to a terminal state, if any.
    pub fn diagnostic(&self) -> Option<&str> {
        match &self.status {
            TaskStatus::Failed { diagnostic } | TaskStatus::NeedsReview { diagnostic } => {
                Some(diagnostic)
            }
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}
