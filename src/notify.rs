//! Outbound task events.
//!
//! Notification is fire-and-forget: the orchestrator never waits on a
//! notifier and a failing receiver never affects processing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::task::{Task, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskStarted,
    TaskSucceeded,
    TaskFailed,
    NeedsReview,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub kind: EventKind,
    pub task_id: TaskId,
    /// Status name after the event.
    pub outcome: String,
    pub confidence: Option<f64>,
    pub result_ref: Option<String>,
    pub diagnostic: Option<String>,
    pub at: DateTime<Utc>,
}

impl TaskEvent {
    /// Event describing `task` as it is now.
    pub fn from_task(kind: EventKind, task: &Task) -> Self {
        Self {
            kind,
            task_id: task.id.clone(),
            outcome: task.status.name().to_string(),
            confidence: task.confidence,
            result_ref: task.result_ref.clone(),
            diagnostic: task.diagnostic().map(String::from),
            at: Utc::now(),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: TaskEvent);
}

/// Forwards events to an unbounded channel. Dropped receivers are ignored.
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<TaskEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TaskEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, event: TaskEvent) {
        let _ = self.tx.send(event);
    }
}

/// Writes each event to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: TaskEvent) {
        tracing::info!(
            event = ?event.kind,
            task_id = %event.task_id,
            outcome = %event.outcome,
            confidence = ?event.confidence,
            result_ref = ?event.result_ref,
            "task event"
        );
    }
}

/// Delivers every event to each inner notifier.
#[derive(Default)]
pub struct FanoutNotifier {
    inner: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.inner.push(notifier);
        self
    }
}

impl Notifier for FanoutNotifier {
    fn notify(&self, event: TaskEvent) {
        for notifier in &self.inner {
            notifier.notify(event.clone());
        }
    }
}
