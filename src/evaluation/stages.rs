//! Built-in verification stages.

use super::{Stage, StageInput, StageReport};
use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;
use std::time::Instant;
use tokio::process::Command;

/// Longest diagnostic kept from command output.
const DIAGNOSTIC_TAIL: usize = 2000;

/// Keep the end of `text`, where failures usually are.
pub(crate) fn tail(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

struct ShellOutput {
    success: bool,
    code: Option<i32>,
    output: String,
}

/// Run `command` through `sh -c` in `cwd`. The child dies with the future.
async fn run_shell(command: &str, cwd: &Path) -> Result<ShellOutput> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .kill_on_drop(true)
        .output()
        .await?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(&stderr);
    }

    Ok(ShellOutput {
        success: output.status.success(),
        code: output.status.code(),
        output: combined,
    })
}

/// Fails when the collaborator did not report completion.
#[derive(Debug, Clone, Default)]
pub struct CompletionStage;

#[async_trait]
impl Stage for CompletionStage {
    fn name(&self) -> &str {
        "completion"
    }

    async fn run(&self, input: StageInput<'_>) -> Result<StageReport> {
        if input.execution.self_reported_complete {
            return Ok(StageReport::pass());
        }
        let output = tail(&input.execution.raw_output, DIAGNOSTIC_TAIL);
        let diagnostic = if output.is_empty() {
            "collaborator did not report completion".to_string()
        } else {
            format!("collaborator did not report completion:\n{}", output)
        };
        Ok(StageReport::fail(diagnostic))
    }
}

/// Runs a shell command in the workspace and passes on exit code 0.
#[derive(Debug, Clone)]
pub struct CommandStage {
    name: String,
    command: String,
}

impl CommandStage {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl Stage for CommandStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, input: StageInput<'_>) -> Result<StageReport> {
        let started = Instant::now();
        let out = run_shell(&self.command, &input.workspace.path).await?;
        let elapsed = started.elapsed().as_millis() as u64;

        let report = if out.success {
            StageReport::pass()
        } else {
            StageReport::fail(format!(
                "`{}` exited with {}:\n{}",
                self.command,
                out.code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into()),
                tail(&out.output, DIAGNOSTIC_TAIL)
            ))
        };
        Ok(report.with_duration(elapsed))
    }
}

/// Runs each acceptance criterion as a shell command.
///
/// Every criterion runs so the signal reflects the fraction passing; the
/// stage passes only when all of them do.
#[derive(Debug, Clone, Default)]
pub struct AcceptanceStage;

#[async_trait]
impl Stage for AcceptanceStage {
    fn name(&self) -> &str {
        "acceptance"
    }

    async fn run(&self, input: StageInput<'_>) -> Result<StageReport> {
        let criteria = &input.task.acceptance_criteria;
        if criteria.is_empty() {
            return Ok(StageReport::pass().with_signal(1.0));
        }

        let started = Instant::now();
        let mut failures = Vec::new();
        for criterion in criteria {
            let out = run_shell(criterion, &input.workspace.path).await?;
            if !out.success {
                failures.push(format!(
                    "`{}`: {}",
                    criterion,
                    tail(&out.output, DIAGNOSTIC_TAIL / criteria.len().max(1))
                ));
            }
        }
        let elapsed = started.elapsed().as_millis() as u64;

        let passed = criteria.len() - failures.len();
        let signal = passed as f64 / criteria.len() as f64;
        let report = if failures.is_empty() {
            StageReport::pass()
        } else {
            StageReport::fail(format!(
                "{}/{} acceptance criteria failed\n{}",
                failures.len(),
                criteria.len(),
                failures.join("\n")
            ))
        };
        Ok(report.with_signal(signal).with_duration(elapsed))
    }
}
