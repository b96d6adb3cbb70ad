//! Core domain models for conductor.
//!
//! This module contains the task data model and the dependency graph
//! used to resolve which tasks are ready to run.

pub mod dag;
pub mod task;

pub use dag::{blocked_tasks, ready_tasks, TaskGraph};
pub use task::{Priority, Task, TaskDescriptor, TaskId, TaskList, TaskStatus};
