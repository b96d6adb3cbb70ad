//! Workspace isolation.
//!
//! Every in-flight task gets its own branch and directory, both derived
//! from the task identifier. [`IsolationManager`] owns the lifecycle and
//! the durable registry; the [`Isolation`] provider does the actual work
//! (git worktrees in production, in-memory fakes in tests).
//!
//! Provider calls are synchronous and are expected to be run on a
//! blocking thread by async callers.

mod worktree;

pub use worktree::GitWorktreeIsolation;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::task::TaskId;
use crate::state::{ReviewRecord, WorkspaceRegistry};
use crate::{Error, Result};

/// An isolated working copy owned by exactly one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub task_id: TaskId,
    pub branch: String,
    pub path: PathBuf,
    /// Commit the branch was created from, once known.
    #[serde(default)]
    pub base_commit: Option<String>,
}

/// Backend that creates and destroys workspaces.
pub trait Isolation: Send + Sync {
    /// Create the branch and directory. Returns the base commit, if the
    /// backend has one.
    ///
    /// `Error::WorkspaceExists` means nothing was created and the existing
    /// branch or directory must be left alone.
    fn create(&self, workspace: &Workspace) -> Result<Option<String>>;

    /// Remove the directory and, unless `keep_branch`, the branch. Must
    /// succeed on a workspace that is partially created or already gone.
    fn destroy(&self, workspace: &Workspace, keep_branch: bool) -> Result<()>;

    /// Fold the workspace branch into `target`. Returns the resulting
    /// target commit. A conflict is `Error::Integration`.
    fn integrate(&self, workspace: &Workspace, target: &str) -> Result<String>;

    /// Changed lines between the base commit and `patch_ref`.
    fn change_size(&self, workspace: &Workspace, patch_ref: &str) -> Result<usize>;
}

/// What a sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub disposed: Vec<TaskId>,
    pub failed: Vec<(TaskId, String)>,
}

/// Provisions, tracks and disposes workspaces.
pub struct IsolationManager {
    provider: Arc<dyn Isolation>,
    registry: Mutex<WorkspaceRegistry>,
    root: PathBuf,
    branch_prefix: String,
    target_branch: String,
    run_id: Uuid,
}

impl IsolationManager {
    pub fn new(
        provider: Arc<dyn Isolation>,
        registry: WorkspaceRegistry,
        root: &Path,
        branch_prefix: &str,
        target_branch: &str,
    ) -> Self {
        Self {
            provider,
            registry: Mutex::new(registry),
            root: root.to_path_buf(),
            branch_prefix: branch_prefix.to_string(),
            target_branch: target_branch.to_string(),
            run_id: Uuid::new_v4(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn target_branch(&self) -> &str {
        &self.target_branch
    }

    /// Directory under which workspaces are created.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn registry(&self) -> Result<MutexGuard<'_, WorkspaceRegistry>> {
        self.registry
            .lock()
            .map_err(|_| Error::StoreCorrupted("workspace registry lock poisoned".into()))
    }

    /// Run `f` with the registry locked.
    pub fn with_registry<T>(&self, f: impl FnOnce(&mut WorkspaceRegistry) -> Result<T>) -> Result<T> {
        let mut registry = self.registry()?;
        f(&mut registry)
    }

    /// Deterministic workspace for a task; nothing is created.
    pub fn plan(&self, task_id: &TaskId) -> Workspace {
        Workspace {
            task_id: task_id.clone(),
            branch: format!("{}{}", self.branch_prefix, task_id),
            path: self.root.join(task_id.as_str()),
            base_commit: None,
        }
    }

    /// Register and create a workspace.
    ///
    /// On failure the partial workspace is destroyed and deregistered
    /// before `Error::Provision` is returned. A workspace that already
    /// existed is only deregistered.
    pub fn provision(&self, task_id: &TaskId) -> Result<Workspace> {
        let mut workspace = self.plan(task_id);
        self.registry()?.register(workspace.clone(), self.run_id)?;

        match self.provider.create(&workspace) {
            Ok(base) => {
                workspace.base_commit = base;
                self.registry()?.activate(&workspace)?;
                tracing::debug!(
                    task_id = %task_id,
                    branch = %workspace.branch,
                    path = %workspace.path.display(),
                    "workspace provisioned"
                );
                Ok(workspace)
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "workspace provisioning failed");
                if matches!(e, Error::WorkspaceExists(_)) {
                    self.registry()?.deregister(task_id)?;
                } else if let Err(cleanup) = self.provider.destroy(&workspace, false) {
                    tracing::error!(task_id = %task_id, error = %cleanup, "cleanup after failed provisioning failed");
                    self.registry()?.mark_orphaned(task_id, &cleanup.to_string())?;
                } else {
                    self.registry()?.deregister(task_id)?;
                }
                Err(Error::Provision {
                    task: task_id.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Dispose a workspace exactly once.
    ///
    /// Returns `Ok(false)` if it was already disposed or claimed by another
    /// caller. A failed disposal leaves the entry flagged as orphaned for
    /// the next sweep.
    pub fn dispose(&self, task_id: &TaskId, keep_branch: bool) -> Result<bool> {
        let Some(workspace) = self.registry()?.claim_for_disposal(task_id)? else {
            return Ok(false);
        };

        match self.provider.destroy(&workspace, keep_branch) {
            Ok(()) => {
                self.registry()?.deregister(task_id)?;
                tracing::debug!(task_id = %task_id, keep_branch, "workspace disposed");
                Ok(true)
            }
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "workspace disposal failed; flagged as orphaned");
                self.registry()?.mark_orphaned(task_id, &e.to_string())?;
                Err(Error::Dispose {
                    task: task_id.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Dispose a workspace but keep its branch for human review.
    pub fn retain_for_review(
        &self,
        workspace: &Workspace,
        patch_ref: Option<&str>,
        confidence: Option<f64>,
        diagnostic: &str,
    ) -> Result<bool> {
        let disposed = self.dispose(&workspace.task_id, true)?;
        self.registry()?.retain_for_review(ReviewRecord {
            task_id: workspace.task_id.clone(),
            branch: workspace.branch.clone(),
            base_commit: workspace.base_commit.clone(),
            patch_ref: patch_ref.map(String::from),
            confidence,
            diagnostic: diagnostic.to_string(),
            retained_at: Utc::now(),
        })?;
        Ok(disposed)
    }

    /// Fold a live workspace into the target branch.
    pub fn integrate(&self, workspace: &Workspace) -> Result<String> {
        let commit = self.provider.integrate(workspace, &self.target_branch)?;
        tracing::info!(task_id = %workspace.task_id, target = %self.target_branch, commit = %commit, "changes integrated");
        Ok(commit)
    }

    pub fn change_size(&self, workspace: &Workspace, patch_ref: &str) -> Result<usize> {
        self.provider.change_size(workspace, patch_ref)
    }

    /// Branches retained for review.
    pub fn reviews(&self) -> Result<Vec<ReviewRecord>> {
        Ok(self.registry()?.reviews().into_iter().cloned().collect())
    }

    /// Integrate a retained branch and delete it.
    pub fn integrate_retained(&self, task_id: &TaskId) -> Result<String> {
        let record = self
            .registry()?
            .review(task_id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;
        let workspace = Workspace {
            task_id: task_id.clone(),
            branch: record.branch.clone(),
            path: self.root.join(task_id.as_str()),
            base_commit: record.base_commit.clone(),
        };
        let commit = self.provider.integrate(&workspace, &self.target_branch)?;
        self.provider.destroy(&workspace, false)?;
        self.registry()?.take_review(task_id)?;
        tracing::info!(task_id = %task_id, commit = %commit, "retained branch integrated");
        Ok(commit)
    }

    /// Delete a retained branch without integrating it.
    pub fn discard_retained(&self, task_id: &TaskId) -> Result<()> {
        let record = self
            .registry()?
            .review(task_id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;
        let workspace = Workspace {
            task_id: task_id.clone(),
            branch: record.branch,
            path: self.root.join(task_id.as_str()),
            base_commit: record.base_commit,
        };
        self.provider.destroy(&workspace, false)?;
        self.registry()?.take_review(task_id)?;
        tracing::info!(task_id = %task_id, "retained branch discarded");
        Ok(())
    }

    /// Dispose every registered workspace. Stale claims left by an earlier
    /// process are released first.
    pub fn sweep(&self) -> Result<SweepReport> {
        let ids = {
            let mut registry = self.registry()?;
            registry.release_stale_claims(self.run_id)?;
            registry.ids()
        };

        let mut report = SweepReport::default();
        for id in ids {
            match self.dispose(&id, false) {
                Ok(true) => report.disposed.push(id),
                Ok(false) => {}
                Err(e) => report.failed.push((id, e.to_string())),
            }
        }
        if !report.disposed.is_empty() || !report.failed.is_empty() {
            tracing::info!(
                disposed = report.disposed.len(),
                failed = report.failed.len(),
                "workspace sweep finished"
            );
        }
        Ok(report)
    }

    pub fn active_count(&self) -> Result<usize> {
        Ok(self.registry()?.len())
    }
}
