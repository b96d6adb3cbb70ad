//! Coordinator loop and control surface.
//!
//! One control flow owns dispatch and is the only writer of slot outcomes
//! to the task store. Slots run as tasks in a `JoinSet`; each gets a child
//! of the global cancellation token so a stop reaches all of them at once.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{self, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use super::pipeline::{run_slot, SlotContext, SlotReport, Verdict};
use super::pool::SlotPool;
use super::scheduler;
use crate::core::task::{Task, TaskId};
use crate::notify::{EventKind, Notifier, TaskEvent};
use crate::state::SharedStore;
use crate::util::blocking;
use crate::Result;

/// Diagnostic for a task stopped after evaluation had begun.
pub const CANCELLED_DIAGNOSTIC: &str = "cancelled by stop request during evaluation";

/// What a run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub succeeded: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    pub needs_review: Vec<TaskId>,
    /// Tasks left pending because a dependency never succeeded.
    pub blocked: Vec<TaskId>,
    /// The run ended because of a stop request.
    pub stopped: bool,
}

impl RunSummary {
    pub fn processed(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.needs_review.len()
    }
}

/// Cheap, cloneable handle for pausing, stopping and inspecting a run.
#[derive(Clone)]
pub struct ControlHandle {
    store: SharedStore,
    cancel: CancellationToken,
    pause: Arc<watch::Sender<bool>>,
}

impl ControlHandle {
    /// Stop dispatching new tasks. In-flight tasks continue.
    pub fn pause(&self) {
        tracing::info!("pause requested");
        self.pause.send_replace(true);
    }

    pub fn resume(&self) {
        tracing::info!("resume requested");
        self.pause.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.pause.borrow()
    }

    /// Emergency stop: terminate all in-flight work.
    pub fn stop(&self) {
        tracing::warn!("stop requested");
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Snapshot of every task.
    pub async fn status(&self) -> Vec<Task> {
        self.store.read().await.tasks().to_vec()
    }
}

pub struct Orchestrator {
    store: SharedStore,
    ctx: Arc<SlotContext>,
    pool: SlotPool,
    notifier: Arc<dyn Notifier>,
    cancel: CancellationToken,
    pause: Arc<watch::Sender<bool>>,
}

impl Orchestrator {
    /// # Errors
    ///
    /// A validation error if `concurrency` is zero.
    pub fn new(
        store: SharedStore,
        ctx: SlotContext,
        concurrency: usize,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let (pause, _) = watch::channel(false);
        Ok(Self {
            store,
            ctx: Arc::new(ctx),
            pool: SlotPool::new(concurrency)?,
            notifier,
            cancel: CancellationToken::new(),
            pause: Arc::new(pause),
        })
    }

    pub fn control(&self) -> ControlHandle {
        ControlHandle {
            store: self.store.clone(),
            cancel: self.cancel.clone(),
            pause: self.pause.clone(),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Highest number of simultaneously occupied slots so far.
    pub fn peak_concurrency(&self) -> usize {
        self.pool.peak()
    }

    /// Process tasks until nothing is ready and nothing is running, or
    /// until stopped.
    ///
    /// An invalid dependency graph is reported before anything is
    /// dispatched. A fatal error cancels in-flight work, disposes every
    /// workspace and is returned.
    pub async fn run(&mut self) -> Result<RunSummary> {
        self.store.read().await.ready()?;
        tracing::info!(
            concurrency = self.pool.capacity(),
            run_id = %self.ctx.isolation.run_id(),
            "run started"
        );

        let cancel = self.cancel.clone();
        let mut pause_rx = self.pause.subscribe();
        let mut set: JoinSet<SlotReport> = JoinSet::new();
        let mut in_flight: HashMap<task::Id, TaskId> = HashMap::new();
        let mut summary = RunSummary::default();

        let outcome: Result<()> = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }

            let paused = *pause_rx.borrow_and_update();
            if !paused {
                if let Err(e) = self.dispatch(&mut set, &mut in_flight).await {
                    break Err(e);
                }
            }

            if set.is_empty() && !paused {
                break Ok(());
            }

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = pause_rx.changed() => {}
                Some(joined) = set.join_next_with_id(), if !set.is_empty() => {
                    if let Err(e) = self.reap(joined, &mut in_flight, &mut summary).await {
                        break Err(e);
                    }
                }
            }
        };

        summary.stopped = cancel.is_cancelled();
        if outcome.is_err() || summary.stopped {
            self.shutdown(&mut set, &mut in_flight, &mut summary).await;
        }

        if let Err(e) = outcome {
            tracing::error!(error = %e, "run halted");
            return Err(e);
        }

        if !summary.stopped {
            let store = self.store.read().await;
            summary.blocked = store.blocked().iter().map(|t| t.id.clone()).collect();
            if !summary.blocked.is_empty() {
                tracing::warn!(blocked = summary.blocked.len(), "tasks left blocked by unmet dependencies");
            }
        }
        tracing::info!(
            succeeded = summary.succeeded.len(),
            failed = summary.failed.len(),
            needs_review = summary.needs_review.len(),
            blocked = summary.blocked.len(),
            stopped = summary.stopped,
            "run finished"
        );
        Ok(summary)
    }

    /// Fill free slots from the ready set, under one store write lock.
    async fn dispatch(
        &mut self,
        set: &mut JoinSet<SlotReport>,
        in_flight: &mut HashMap<task::Id, TaskId>,
    ) -> Result<()> {
        let free = self.pool.free_count();
        if free == 0 {
            return Ok(());
        }

        let mut store = self.store.write().await;
        for id in scheduler::next_batch(&store, free)? {
            let task = store.mark_running(&id)?;
            self.pool.occupy(&id)?;
            tracing::info!(task_id = %id, priority = %task.priority, "task dispatched");
            self.notifier
                .notify(TaskEvent::from_task(EventKind::TaskStarted, &task));

            let handle = set.spawn(run_slot(self.ctx.clone(), task, self.cancel.child_token()));
            in_flight.insert(handle.id(), id);
        }
        Ok(())
    }

    async fn reap(
        &mut self,
        joined: std::result::Result<(task::Id, SlotReport), JoinError>,
        in_flight: &mut HashMap<task::Id, TaskId>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let report = match joined {
            Ok((tid, report)) => {
                in_flight.remove(&tid);
                report
            }
            Err(err) => {
                let Some(task_id) = in_flight.remove(&err.id()) else {
                    return Ok(());
                };
                self.crashed(task_id, err).await
            }
        };
        self.pool.release_task(&report.task_id);
        self.apply(report, summary).await
    }

    /// A slot task panicked or was aborted: dispose its workspace and fail it.
    async fn crashed(&self, task_id: TaskId, err: JoinError) -> SlotReport {
        let diagnostic = if err.is_panic() {
            let payload = err.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            format!("executor crashed: {}", message)
        } else {
            "execution aborted".to_string()
        };
        tracing::error!(task_id = %task_id, diagnostic = %diagnostic, "slot crashed");

        let isolation = self.ctx.isolation.clone();
        let id = task_id.clone();
        if let Err(e) = blocking(move || isolation.dispose(&id, false)).await {
            tracing::error!(task_id = %task_id, error = %e, "disposal after crash failed");
        }

        SlotReport {
            task_id,
            verdict: Verdict::Failed(diagnostic),
            confidence: None,
            result_ref: None,
            branch: None,
            attempts: 0,
            evaluations: Vec::new(),
        }
    }

    /// Write a slot's outcome to the store and notify.
    async fn apply(&self, report: SlotReport, summary: &mut RunSummary) -> Result<()> {
        let SlotReport {
            task_id,
            verdict,
            confidence,
            result_ref,
            branch,
            attempts,
            evaluations,
        } = report;

        let mut store = self.store.write().await;

        if verdict == (Verdict::Cancelled { partially_evaluated: false }) {
            store.update(&task_id, |task| {
                task.attempts += attempts;
                task.revert_to_pending()
            })?;
            tracing::info!(task_id = %task_id, "task reverted to pending");
            return Ok(());
        }

        let task = store.update(&task_id, |task| {
            task.confidence = confidence;
            task.result_ref = result_ref;
            if branch.is_some() {
                task.branch_name = branch;
            }
            task.attempts += attempts;
            task.evaluations.extend(evaluations);
            match &verdict {
                Verdict::Succeeded => task.succeed(),
                Verdict::NeedsReview(diagnostic) => task.needs_review(diagnostic),
                Verdict::Failed(diagnostic) => task.fail(diagnostic),
                Verdict::Cancelled { .. } => task.fail(CANCELLED_DIAGNOSTIC),
            }
        })?;
        drop(store);

        let kind = match &verdict {
            Verdict::Succeeded => {
                summary.succeeded.push(task_id.clone());
                EventKind::TaskSucceeded
            }
            Verdict::NeedsReview(_) => {
                summary.needs_review.push(task_id.clone());
                EventKind::NeedsReview
            }
            Verdict::Failed(_) | Verdict::Cancelled { .. } => {
                summary.failed.push(task_id.clone());
                EventKind::TaskFailed
            }
        };
        tracing::info!(
            task_id = %task_id,
            status = %task.status,
            confidence = ?task.confidence,
            "task finished"
        );
        self.notifier.notify(TaskEvent::from_task(kind, &task));
        Ok(())
    }

    /// Cancel everything, wait for every slot to report, then sweep.
    async fn shutdown(
        &mut self,
        set: &mut JoinSet<SlotReport>,
        in_flight: &mut HashMap<task::Id, TaskId>,
        summary: &mut RunSummary,
    ) {
        self.cancel.cancel();
        while let Some(joined) = set.join_next_with_id().await {
            if let Err(e) = self.reap(joined, in_flight, summary).await {
                tracing::error!(error = %e, "could not record outcome during shutdown");
            }
        }

        let isolation = self.ctx.isolation.clone();
        match blocking(move || isolation.sweep()).await {
            Ok(report) if !report.failed.is_empty() => {
                tracing::error!(failed = report.failed.len(), "workspaces left orphaned after shutdown");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "workspace sweep failed"),
        }
    }
}
