//! Git worktree isolation: one branch and one worktree per task.

use std::path::Path;
use std::sync::Mutex;

use super::{Isolation, Workspace};
use crate::git::{GitOps, MergeOutcome};
use crate::{Error, Result};

pub struct GitWorktreeIsolation {
    git: GitOps,
    /// Branch new workspaces start from.
    base_branch: String,
    /// Integrations move the target ref; only one at a time.
    integration_lock: Mutex<()>,
}

impl GitWorktreeIsolation {
    pub fn new(repo_path: &Path, base_branch: &str) -> Result<Self> {
        Ok(Self {
            git: GitOps::new(repo_path)?,
            base_branch: base_branch.to_string(),
            integration_lock: Mutex::new(()),
        })
    }

    pub fn git(&self) -> &GitOps {
        &self.git
    }
}

impl Isolation for GitWorktreeIsolation {
    fn create(&self, workspace: &Workspace) -> Result<Option<String>> {
        if self.git.branch_exists(&workspace.branch)? {
            return Err(Error::WorkspaceExists(format!(
                "branch {}",
                workspace.branch
            )));
        }
        if workspace.path.exists() {
            return Err(Error::WorkspaceExists(format!(
                "directory {}",
                workspace.path.display()
            )));
        }
        let base = self
            .git
            .create_worktree(&workspace.branch, &self.base_branch, &workspace.path)?;
        Ok(Some(base))
    }

    fn destroy(&self, workspace: &Workspace, keep_branch: bool) -> Result<()> {
        self.git.remove_worktree(&workspace.path)?;
        if !keep_branch {
            self.git.delete_branch(&workspace.branch)?;
        }
        Ok(())
    }

    fn integrate(&self, workspace: &Workspace, target: &str) -> Result<String> {
        let _guard = self
            .integration_lock
            .lock()
            .map_err(|_| Error::StoreCorrupted("integration lock poisoned".into()))?;

        let message = format!("conductor: integrate {}", workspace.task_id);
        let outcome = self
            .git
            .merge_branch(&workspace.branch, target, &message)
            .map_err(|e| Error::Integration {
                task: workspace.task_id.clone(),
                reason: e.to_string(),
            })?;

        match outcome {
            MergeOutcome::Conflict { paths } => Err(Error::Integration {
                task: workspace.task_id.clone(),
                reason: format!("merge conflict in {}", paths.join(", ")),
            }),
            other => Ok(other.commit().unwrap_or_default().to_string()),
        }
    }

    fn change_size(&self, workspace: &Workspace, patch_ref: &str) -> Result<usize> {
        let base = workspace
            .base_commit
            .as_deref()
            .unwrap_or(self.base_branch.as_str());
        self.git.diff_size(base, patch_ref)
    }
}
