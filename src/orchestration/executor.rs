//! Execution collaborator interface.
//!
//! The orchestrator treats execution as opaque: it hands a task and its
//! workspace to an [`Executor`] and gets back a patch reference plus a
//! self-reported completion signal. Executors never touch the task store.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;

use crate::core::task::Task;
use crate::git::GitOps;
use crate::isolation::Workspace;
use crate::util::blocking;
use crate::{Error, Result};

/// What one execution produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutput {
    /// Commit holding the changes.
    pub patch_ref: String,
    pub self_reported_complete: bool,
    /// Unparsed collaborator output, for diagnostics and the review signal.
    pub raw_output: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutionRequest<'a> {
    pub task: &'a Task,
    pub workspace: &'a Workspace,
    /// 1 for the first execution, higher for debug retries.
    pub attempt: u32,
    /// Failure diagnostics from the previous attempt.
    pub feedback: Option<&'a str>,
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest<'_>) -> Result<ExecutionOutput>;
}

/// Prompt handed to a command-line agent.
pub fn build_prompt(request: &ExecutionRequest<'_>) -> String {
    let task = request.task;
    let mut prompt = format!("Task {}: {}\n", task.id, task.description);
    if !task.acceptance_criteria.is_empty() {
        prompt.push_str("\nAcceptance criteria (each must pass):\n");
        for criterion in &task.acceptance_criteria {
            prompt.push_str(&format!("- {}\n", criterion));
        }
    }
    if let Some(feedback) = request.feedback {
        prompt.push_str(&format!(
            "\nAttempt {} failed verification. Fix the following and try again:\n{}\n",
            request.attempt.saturating_sub(1),
            feedback
        ));
    }
    prompt.push_str(
        "\nWork only inside the current directory. When finished, print a final line \
         `CONFIDENCE: <0.0-1.0>` rating how sure you are the task is complete.\n",
    );
    prompt
}

/// Runs a command-line agent in the workspace and commits what it left.
///
/// The prompt is passed as the last argument. Exit status 0 is the
/// completion signal. The child is killed if the execution is dropped.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandExecutor {
    /// Parse `command` (program followed by arguments) and locate the
    /// program on `PATH`.
    ///
    /// # Errors
    ///
    /// `CommandNotFound` if the program cannot be found.
    pub fn new(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::Validation("executor command is empty".into()))?;
        let program =
            which::which(program).map_err(|_| Error::CommandNotFound(program.to_string()))?;
        Ok(Self {
            program,
            args: parts.map(String::from).collect(),
        })
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(&self, request: ExecutionRequest<'_>) -> Result<ExecutionOutput> {
        let prompt = build_prompt(&request);
        tracing::debug!(
            task_id = %request.task.id,
            attempt = request.attempt,
            program = %self.program.display(),
            "starting executor"
        );

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&prompt)
            .current_dir(&request.workspace.path)
            .kill_on_drop(true)
            .output()
            .await?;

        let mut raw_output = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            raw_output.push_str("\n[stderr]\n");
            raw_output.push_str(&stderr);
        }
        tracing::trace!(task_id = %request.task.id, output = %raw_output, "executor output");

        let path = request.workspace.path.clone();
        let message = format!(
            "conductor: {} (attempt {})",
            request.task.id, request.attempt
        );
        let patch_ref = blocking(move || GitOps::new(&path)?.commit_all(&path, &message)).await?;

        Ok(ExecutionOutput {
            patch_ref,
            self_reported_complete: output.status.success(),
            raw_output,
        })
    }
}
