//! Crash recovery.
//!
//! A process that dies mid-run leaves registered workspaces behind and
//! tasks marked `running`. [`recover`] reconciles both before the next run:
//! every registered workspace is disposed (review branches are kept) and
//! every `running` task goes back to `pending`.
//!
//! # Orphan detection
//!
//! Directories under the worktree root that no registry entry accounts for
//! are reported but never deleted; they were not created by this tool's
//! bookkeeping and may belong to someone else.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::task::TaskId;
use crate::isolation::IsolationManager;
use crate::state::SharedStore;
use crate::util::blocking;
use crate::Result;

/// Report of a recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Workspaces that were disposed.
    pub removed: Vec<TaskId>,
    /// Workspaces whose disposal failed; they stay flagged as orphaned.
    pub failed: Vec<(TaskId, String)>,
    /// Tasks reverted from `running` to `pending`.
    pub reverted: Vec<TaskId>,
    /// Directories under the worktree root with no registry entry.
    pub untracked: Vec<PathBuf>,
}

impl CleanupReport {
    /// Nothing needed doing.
    pub fn is_clean(&self) -> bool {
        self.removed.is_empty()
            && self.failed.is_empty()
            && self.reverted.is_empty()
            && self.untracked.is_empty()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Reconcile the registry and the task store after an unclean exit.
pub async fn recover(store: &SharedStore, isolation: Arc<IsolationManager>) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();

    let manager = isolation.clone();
    let sweep = blocking(move || manager.sweep()).await?;
    report.removed = sweep.disposed;
    report.failed = sweep.failed;

    report.reverted = store.write().await.revert_all_running()?;

    let manager = isolation.clone();
    report.untracked = blocking(move || {
        let known: HashSet<String> = manager.with_registry(|r| {
            let mut ids: HashSet<String> = r.ids().iter().map(|id| id.to_string()).collect();
            ids.extend(r.reviews().iter().map(|rec| rec.task_id.to_string()));
            Ok(ids)
        })?;
        Ok(detect_untracked(manager.root(), &known))
    })
    .await?;

    for (id, reason) in &report.failed {
        tracing::error!(task_id = %id, reason = %reason, "workspace could not be recovered");
    }
    for path in &report.untracked {
        tracing::warn!(path = %path.display(), "untracked directory under worktree root");
    }
    if !report.is_clean() {
        tracing::info!(
            removed = report.removed.len(),
            failed = report.failed.len(),
            reverted = report.reverted.len(),
            untracked = report.untracked.len(),
            "recovery finished"
        );
    }
    Ok(report)
}

/// Directories directly under `root` whose name is not in `known`.
pub fn detect_untracked(root: &Path, known: &HashSet<String>) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    let mut untracked: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter(|e| !known.contains(e.file_name().to_string_lossy().as_ref()))
        .map(|e| e.path())
        .collect();
    untracked.sort();
    untracked
}
