//! Execution slots.
//!
//! The `SlotPool` holds exactly N slots. Each slot is free or occupied by
//! one task; a task can only be dispatched into a free slot, so the number
//! of in-flight tasks never exceeds N.

use crate::core::task::TaskId;
use crate::error::{Error, Result};

/// Index of a slot within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub usize);

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// Fixed-capacity set of execution slots.
///
/// # Example
///
/// ```ignore
/// use conductor::orchestration::SlotPool;
///
/// let mut pool = SlotPool::new(2)?;
/// let slot = pool.occupy(&task_id)?;
/// assert_eq!(pool.free_count(), 1);
/// pool.release_task(&task_id);
/// ```
#[derive(Debug)]
pub struct SlotPool {
    slots: Vec<Option<TaskId>>,
    /// Highest simultaneous occupancy seen.
    peak: usize,
}

impl SlotPool {
    /// Create a pool with `capacity` slots.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Validation(
                "concurrency must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            slots: vec![None; capacity],
            peak: 0,
        })
    }

    /// Place a task in the lowest free slot.
    ///
    /// # Errors
    ///
    /// `PoolFull` if every slot is occupied, or a validation error if the
    /// task already holds a slot.
    pub fn occupy(&mut self, task_id: &TaskId) -> Result<SlotId> {
        if self.slot_of(task_id).is_some() {
            return Err(Error::Validation(format!(
                "task {} already occupies a slot",
                task_id
            )));
        }
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::PoolFull {
                max: self.capacity(),
            })?;
        self.slots[index] = Some(task_id.clone());
        self.peak = self.peak.max(self.active_count());
        Ok(SlotId(index))
    }

    /// Free whichever slot `task_id` holds.
    pub fn release_task(&mut self, task_id: &TaskId) -> Option<SlotId> {
        let slot = self.slot_of(task_id)?;
        self.slots[slot.0] = None;
        Some(slot)
    }

    pub fn slot_of(&self, task_id: &TaskId) -> Option<SlotId> {
        self.slots
            .iter()
            .position(|s| s.as_ref() == Some(task_id))
            .map(SlotId)
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn free_count(&self) -> usize {
        self.capacity() - self.active_count()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn peak(&self) -> usize {
        self.peak
    }
}
