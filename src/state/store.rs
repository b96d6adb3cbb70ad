//! Durable task store.
//!
//! Tasks are kept in insertion order (the creation-order tie-break for
//! scheduling) with an identifier index. Every mutation is written through
//! to `tasks.json` before it returns. Access from concurrent code goes
//! through [`SharedStore`], whose lock serializes every read-modify-write.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::dag::{blocked_tasks, ready_tasks, TaskGraph};
use crate::core::task::{Task, TaskDescriptor, TaskId, TaskStatus};
use crate::util::write_atomic;
use crate::{Error, Result};

pub const STORE_FILE: &str = "tasks.json";
const STORE_VERSION: u32 = 1;

/// Store shared between the coordinator and the control surface.
pub type SharedStore = Arc<RwLock<TaskStore>>;

#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    tasks: Vec<Task>,
}

#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: Vec<Task>,
    index: HashMap<TaskId, usize>,
    path: Option<PathBuf>,
}

impl TaskStore {
    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the store at `path`, or start empty if the file does not exist.
    ///
    /// # Errors
    /// `StoreCorrupted` if the file cannot be parsed or its tasks violate
    /// the store invariants (duplicate ids, dangling dependencies, cycles).
    pub fn open(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "opening task store");
        let mut store = Self {
            path: Some(path.to_path_buf()),
            ..Self::default()
        };
        if !path.exists() {
            return Ok(store);
        }

        let raw = fs::read_to_string(path)?;
        let file: StoreFile = serde_json::from_str(&raw)
            .map_err(|e| Error::StoreCorrupted(format!("{}: {}", path.display(), e)))?;
        if file.version > STORE_VERSION {
            return Err(Error::StoreCorrupted(format!(
                "{}: unsupported version {}",
                path.display(),
                file.version
            )));
        }

        TaskGraph::build(&file.tasks)
            .and_then(|graph| graph.ensure_acyclic())
            .map_err(|e| Error::StoreCorrupted(format!("{}: {}", path.display(), e)))?;

        for task in file.tasks {
            store.index.insert(task.id.clone(), store.tasks.len());
            store.tasks.push(task);
        }
        tracing::debug!(tasks = store.tasks.len(), "task store loaded");
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write `tasks` as the new file contents. Callers commit to memory
    /// only after this succeeds.
    fn persist(&self, tasks: &[Task]) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = StoreFile {
            version: STORE_VERSION,
            tasks: tasks.to_vec(),
        };
        write_atomic(path, serde_json::to_string_pretty(&file)?.as_bytes())
    }

    /// Intake a batch of tasks.
    ///
    /// The batch is validated as a whole against the current store; any
    /// invalid descriptor, duplicate, dangling dependency or cycle rejects
    /// the entire batch and nothing is inserted.
    pub fn add_batch(&mut self, descriptors: Vec<TaskDescriptor>) -> Result<Vec<TaskId>> {
        let mut incoming = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let task = Task::from_descriptor(descriptor)?;
            if self.index.contains_key(&task.id)
                || incoming.iter().any(|t: &Task| t.id == task.id)
            {
                return Err(Error::DuplicateTask(task.id));
            }
            incoming.push(task);
        }

        let graph = TaskGraph::build(self.tasks.iter().chain(incoming.iter()))?;
        graph.ensure_acyclic()?;

        let ids: Vec<TaskId> = incoming.iter().map(|t| t.id.clone()).collect();
        let mut tasks = self.tasks.clone();
        tasks.extend(incoming);
        self.persist(&tasks)?;

        for task in &tasks[self.tasks.len()..] {
            tracing::info!(task_id = %task.id, priority = %task.priority, "task added");
            self.index.insert(task.id.clone(), self.index.len());
        }
        self.tasks = tasks;
        Ok(ids)
    }

    pub fn add(&mut self, descriptor: TaskDescriptor) -> Result<TaskId> {
        let mut ids = self.add_batch(vec![descriptor])?;
        ids.pop()
            .ok_or_else(|| Error::Validation("empty intake batch".into()))
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    /// All tasks in creation order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Pending tasks whose dependencies have all succeeded.
    pub fn ready(&self) -> Result<Vec<&Task>> {
        ready_tasks(&self.tasks)
    }

    /// Pending tasks held back by a dependency that did not succeed.
    pub fn blocked(&self) -> Vec<&Task> {
        blocked_tasks(&self.tasks)
    }

    pub fn with_status(&self, name: &str) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| t.status.name() == name)
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Running)
            .count()
    }

    /// Apply `f` to a copy of the task and commit it only if `f` succeeds.
    ///
    /// Returns the updated task.
    pub fn update<F>(&mut self, id: &TaskId, f: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) -> Result<()>,
    {
        let &i = self
            .index
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        let mut task = self.tasks[i].clone();
        f(&mut task)?;
        let mut tasks = self.tasks.clone();
        tasks[i] = task.clone();
        self.persist(&tasks)?;
        let before = self.tasks[i].status.name();
        self.tasks = tasks;
        if before != task.status.name() {
            tracing::debug!(task_id = %id, from = before, to = task.status.name(), "status changed");
        }
        Ok(task)
    }

    /// `pending -> running`.
    pub fn mark_running(&mut self, id: &TaskId) -> Result<Task> {
        self.update(id, |task| task.start())
    }

    pub fn revert_to_pending(&mut self, id: &TaskId) -> Result<Task> {
        self.update(id, |task| task.revert_to_pending())
    }

    /// Revert every `running` task to `pending`. Used by crash recovery.
    pub fn revert_all_running(&mut self) -> Result<Vec<TaskId>> {
        let running: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Running)
            .map(|t| t.id.clone())
            .collect();
        for id in &running {
            self.revert_to_pending(id)?;
        }
        Ok(running)
    }
}
