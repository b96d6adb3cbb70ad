//! Dispatch selection.
//!
//! Given the ready set and the number of free execution slots, pick what
//! runs next. The order is fully determined by the inputs: priority tier
//! (most urgent first), then creation time (oldest first), then position
//! in the store. The same store always yields the same dispatch order.

use std::cmp::Reverse;

use crate::core::task::{Task, TaskId};
use crate::state::TaskStore;
use crate::Result;

/// Sort `ready` into dispatch order.
pub fn dispatch_order(mut ready: Vec<&Task>) -> Vec<&Task> {
    // Stable: ties keep store order.
    ready.sort_by_key(|t| (Reverse(t.priority), t.created_at));
    ready
}

/// Up to `free_slots` tasks from `ready`, in dispatch order.
pub fn select(ready: Vec<&Task>, free_slots: usize) -> Vec<TaskId> {
    dispatch_order(ready)
        .into_iter()
        .take(free_slots)
        .map(|t| t.id.clone())
        .collect()
}

/// Resolve the ready set of `store` and select from it.
///
/// Fails, without selecting anything, if the dependency graph is invalid.
pub fn next_batch(store: &TaskStore, free_slots: usize) -> Result<Vec<TaskId>> {
    if free_slots == 0 {
        return Ok(Vec::new());
    }
    Ok(select(store.ready()?, free_slots))
}
