//! Bounded debug-retry state machine.

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-invoke the collaborator with the failure diagnostics.
    Retry { attempt: u32 },
    /// The budget is spent; finalize the task as failed.
    Exhausted,
}

/// Attempt counter for one task.
///
/// Attempt 1 is the initial execution; each retry adds one, up to
/// `1 + max_retries` attempts in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugRetry {
    attempt: u32,
    max_retries: u32,
}

impl DebugRetry {
    pub fn new(max_retries: u32) -> Self {
        Self {
            attempt: 1,
            max_retries,
        }
    }

    /// The attempt currently in progress.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn retries_used(&self) -> u32 {
        self.attempt - 1
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Record a failed attempt and advance.
    pub fn record_failure(&mut self) -> RetryDecision {
        if self.retries_used() >= self.max_retries {
            return RetryDecision::Exhausted;
        }
        self.attempt += 1;
        RetryDecision::Retry {
            attempt: self.attempt,
        }
    }
}
