//! Task dependency graph and readiness resolution.
//!
//! `TaskGraph` is an arena over task identifiers: nodes live in a petgraph
//! `DiGraph`, looked up through a `TaskId -> NodeIndex` map, and edges point
//! from a dependency to the task that waits on it. Cycle detection is an
//! explicit iterative traversal so adversarial inputs cannot exhaust the
//! call stack.

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    /// Not visited yet.
    White,
    /// On the current traversal path.
    Gray,
    /// Fully explored.
    Black,
}

/// Dependency graph built from a set of tasks.
pub struct TaskGraph {
    graph: DiGraph<TaskId, ()>,
    index: HashMap<TaskId, NodeIndex>,
}

impl TaskGraph {
    /// Build the graph for `tasks`.
    ///
    /// # Errors
    /// - `DuplicateTask` if two tasks share an identifier
    /// - `Validation` if a task depends on itself
    /// - `UnknownDependency` if a dependency does not resolve to a task in the set
    pub fn build<'a, I>(tasks: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a Task>,
        I::IntoIter: Clone,
    {
        let tasks = tasks.into_iter();
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for task in tasks.clone() {
            if index.contains_key(&task.id) {
                return Err(Error::DuplicateTask(task.id.clone()));
            }
            let node = graph.add_node(task.id.clone());
            index.insert(task.id.clone(), node);
        }

        for task in tasks {
            let to = index[&task.id];
            for dep in &task.dependencies {
                if dep == &task.id {
                    return Err(Error::Validation(format!(
                        "Task {} depends on itself",
                        task.id
                    )));
                }
                let from = index.get(dep).ok_or_else(|| Error::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                })?;
                graph.update_edge(*from, to, ());
            }
        }

        Ok(Self { graph, index })
    }

    /// Find a dependency cycle, if any.
    ///
    /// Color-marking depth-first traversal with an explicit stack. A
    /// back-edge to a node on the current path is a cycle; the returned
    /// chain starts and ends with the same identifier, following the
    /// "is a dependency of" direction.
    pub fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let mut color = vec![Color::White; self.graph.node_count()];

        for start in self.graph.node_indices() {
            if color[start.index()] != Color::White {
                continue;
            }

            color[start.index()] = Color::Gray;
            let mut stack = vec![(start, self.graph.neighbors_directed(start, Direction::Outgoing))];

            loop {
                let step = match stack.last_mut() {
                    Some((node, neighbors)) => (*node, neighbors.next()),
                    None => break,
                };

                match step {
                    (_, Some(next)) => match color[next.index()] {
                        Color::White => {
                            color[next.index()] = Color::Gray;
                            stack.push((
                                next,
                                self.graph.neighbors_directed(next, Direction::Outgoing),
                            ));
                        }
                        Color::Gray => {
                            let pos = stack.iter().position(|(n, _)| *n == next).unwrap_or(0);
                            let mut chain: Vec<TaskId> = stack[pos..]
                                .iter()
                                .map(|(n, _)| self.graph[*n].clone())
                                .collect();
                            chain.push(self.graph[next].clone());
                            return Some(chain);
                        }
                        Color::Black => {}
                    },
                    (node, None) => {
                        color[node.index()] = Color::Black;
                        stack.pop();
                    }
                }
            }
        }

        None
    }

    /// Fail with `CycleDetected` if the graph has a cycle.
    pub fn ensure_acyclic(&self) -> Result<()> {
        match self.find_cycle() {
            Some(chain) => Err(Error::CycleDetected { chain }),
            None => Ok(()),
        }
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}

/// Resolve the ready set: pending tasks whose dependencies all succeeded.
///
/// The whole graph is validated first. Any unknown dependency or cycle is
/// an error, never a partial list. The result keeps the input order.
pub fn ready_tasks(tasks: &[Task]) -> Result<Vec<&Task>> {
    let graph = TaskGraph::build(tasks)?;
    graph.ensure_acyclic()?;

    let by_id: HashMap<&TaskId, &Task> = tasks.iter().map(|t| (&t.id, t)).collect();

    Ok(tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Pending)
        .filter(|task| {
            task.dependencies.iter().all(|dep| {
                by_id
                    .get(dep)
                    .map(|d| d.status == TaskStatus::Succeeded)
                    .unwrap_or(false)
            })
        })
        .collect())
}

/// Pending tasks that can never become ready because a dependency chain
/// ends in a failed or review-bound task.
pub fn blocked_tasks(tasks: &[Task]) -> Vec<&Task> {
    let by_id: HashMap<&TaskId, &Task> = tasks.iter().map(|t| (&t.id, t)).collect();
    tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Pending)
        .filter(|task| {
            task.dependencies.iter().any(|dep| {
                by_id
                    .get(dep)
                    .map(|d| d.status != TaskStatus::Succeeded)
                    .unwrap_or(true)
            })
        })
        .collect()
}
