use thiserror::Error;

use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid task id {0:?}")]
    InvalidTaskId(String),

    #[error("Task already exists: {0}")]
    DuplicateTask(TaskId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("Dependency cycle detected: {}", join_chain(.chain))]
    CycleDetected { chain: Vec<TaskId> },

    #[error("Invalid status transition for {task}: {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: String,
        to: String,
    },

    #[error("Task store corrupted: {0}")]
    StoreCorrupted(String),

    #[error("Workspace already exists: {0}")]
    WorkspaceExists(String),

    #[error("Failed to provision workspace for {task}: {reason}")]
    Provision { task: TaskId, reason: String },

    #[error("Failed to dispose workspace for {task}: {reason}")]
    Dispose { task: TaskId, reason: String },

    #[error("Failed to integrate {task}: {reason}")]
    Integration { task: TaskId, reason: String },

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Execution pool is full (max: {max})")]
    PoolFull { max: usize },
}

impl Error {
    /// Systemic errors halt processing instead of being recorded on a task.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::StoreCorrupted(_) | Error::InvalidTransition { .. }
        )
    }
}

fn join_chain(chain: &[TaskId]) -> String {
    chain
        .iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type Result<T> = std::result::Result<T, Error>;
