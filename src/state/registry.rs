//! Durable registry of provisioned workspaces.
//!
//! Every workspace is registered before it is created and deregistered
//! only after it has been disposed, so a process that dies mid-run leaves
//! behind a list the next run can sweep. Branches retained for human
//! review are tracked separately and are never swept.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::task::TaskId;
use crate::isolation::Workspace;
use crate::util::write_atomic;
use crate::{Error, Result};

pub const REGISTRY_FILE: &str = "workspaces.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum WorkspaceState {
    /// Registered, creation in progress.
    Provisioning,
    /// Created and owned by a running task.
    Active,
    /// Disposal claimed by exactly one caller.
    Disposing,
    /// Disposal failed; waiting for a sweep.
    Orphaned { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    pub workspace: Workspace,
    pub state: WorkspaceState,
    /// Run that provisioned the workspace.
    pub run_id: Uuid,
    pub registered_at: DateTime<Utc>,
}

/// A task branch kept after its task was routed to review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub task_id: TaskId,
    pub branch: String,
    pub base_commit: Option<String>,
    pub patch_ref: Option<String>,
    pub confidence: Option<f64>,
    pub diagnostic: String,
    pub retained_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    workspaces: BTreeMap<TaskId, WorkspaceRecord>,
    #[serde(default)]
    reviews: BTreeMap<TaskId, ReviewRecord>,
}

#[derive(Debug, Default)]
pub struct WorkspaceRegistry {
    data: RegistryFile,
    path: Option<PathBuf>,
}

impl WorkspaceRegistry {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the registry at `path`, or start empty.
    pub fn open(path: &Path) -> Result<Self> {
        let mut registry = Self {
            data: RegistryFile::default(),
            path: Some(path.to_path_buf()),
        };
        if path.exists() {
            let raw = fs::read_to_string(path)?;
            registry.data = serde_json::from_str(&raw)
                .map_err(|e| Error::StoreCorrupted(format!("{}: {}", path.display(), e)))?;
        }
        Ok(registry)
    }

    fn persist(&self) -> Result<()> {
        match &self.path {
            Some(path) => write_atomic(path, serde_json::to_string_pretty(&self.data)?.as_bytes()),
            None => Ok(()),
        }
    }

    /// Record a workspace before anything is created on disk.
    pub fn register(&mut self, workspace: Workspace, run_id: Uuid) -> Result<()> {
        if let Some(existing) = self.data.workspaces.get(&workspace.task_id) {
            return Err(Error::Provision {
                task: workspace.task_id.clone(),
                reason: format!("workspace already registered ({:?})", existing.state),
            });
        }
        if self.data.reviews.contains_key(&workspace.task_id) {
            return Err(Error::Provision {
                task: workspace.task_id.clone(),
                reason: "branch is retained for review".into(),
            });
        }
        let id = workspace.task_id.clone();
        self.data.workspaces.insert(
            id,
            WorkspaceRecord {
                workspace,
                state: WorkspaceState::Provisioning,
                run_id,
                registered_at: Utc::now(),
            },
        );
        self.persist()
    }

    fn set_state(&mut self, id: &TaskId, state: WorkspaceState) -> Result<()> {
        if let Some(record) = self.data.workspaces.get_mut(id) {
            record.state = state;
            self.persist()?;
        }
        Ok(())
    }

    /// Record the created workspace (with its base commit) as active.
    pub fn activate(&mut self, workspace: &Workspace) -> Result<()> {
        if let Some(record) = self.data.workspaces.get_mut(&workspace.task_id) {
            record.workspace = workspace.clone();
            record.state = WorkspaceState::Active;
            self.persist()?;
        }
        Ok(())
    }

    pub fn mark_orphaned(&mut self, id: &TaskId, reason: &str) -> Result<()> {
        self.set_state(
            id,
            WorkspaceState::Orphaned {
                reason: reason.to_string(),
            },
        )
    }

    /// Claim a workspace for disposal.
    ///
    /// Returns `None` if it is not registered or another caller already
    /// claimed it, so each workspace is torn down by exactly one caller.
    pub fn claim_for_disposal(&mut self, id: &TaskId) -> Result<Option<Workspace>> {
        let claimed = match self.data.workspaces.get_mut(id) {
            Some(record) if record.state != WorkspaceState::Disposing => {
                record.state = WorkspaceState::Disposing;
                Some(record.workspace.clone())
            }
            _ => None,
        };
        if claimed.is_some() {
            self.persist()?;
        }
        Ok(claimed)
    }

    pub fn deregister(&mut self, id: &TaskId) -> Result<Option<WorkspaceRecord>> {
        let removed = self.data.workspaces.remove(id);
        if removed.is_some() {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Entries left `Disposing` by a run other than `current` were
    /// interrupted mid-disposal; make them claimable again.
    pub fn release_stale_claims(&mut self, current: Uuid) -> Result<usize> {
        let mut released = 0;
        for record in self.data.workspaces.values_mut() {
            if record.state == WorkspaceState::Disposing && record.run_id != current {
                record.state = WorkspaceState::Orphaned {
                    reason: "interrupted during disposal".into(),
                };
                released += 1;
            }
        }
        if released > 0 {
            self.persist()?;
        }
        Ok(released)
    }

    pub fn get(&self, id: &TaskId) -> Option<&WorkspaceRecord> {
        self.data.workspaces.get(id)
    }

    pub fn ids(&self) -> Vec<TaskId> {
        self.data.workspaces.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.data.workspaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.workspaces.is_empty()
    }

    pub fn orphaned(&self) -> Vec<&WorkspaceRecord> {
        self.data
            .workspaces
            .values()
            .filter(|r| matches!(r.state, WorkspaceState::Orphaned { .. }))
            .collect()
    }

    pub fn retain_for_review(&mut self, record: ReviewRecord) -> Result<()> {
        self.data.reviews.insert(record.task_id.clone(), record);
        self.persist()
    }

    pub fn review(&self, id: &TaskId) -> Option<&ReviewRecord> {
        self.data.reviews.get(id)
    }

    pub fn reviews(&self) -> Vec<&ReviewRecord> {
        self.data.reviews.values().collect()
    }

    pub fn take_review(&mut self, id: &TaskId) -> Result<Option<ReviewRecord>> {
        let removed = self.data.reviews.remove(id);
        if removed.is_some() {
            self.persist()?;
        }
        Ok(removed)
    }
}
