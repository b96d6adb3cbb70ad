//! Orchestration layer.
//!
//! Scheduling, execution slots, the per-slot pipeline and the coordinator
//! loop that ties them together.

mod executor;
mod orchestrator;
mod pipeline;
mod pool;
pub mod scheduler;

pub use executor::{build_prompt, CommandExecutor, ExecutionOutput, ExecutionRequest, Executor};
pub use orchestrator::{ControlHandle, Orchestrator, RunSummary, CANCELLED_DIAGNOSTIC};
pub use pipeline::{run_slot, SlotContext, SlotReport, Verdict};
pub use pool::{SlotId, SlotPool};
