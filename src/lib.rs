pub mod cleanup;
pub mod config;
pub mod core;
pub mod error;
pub mod evaluation;
pub mod git;
pub mod isolation;
pub mod log;
pub mod merge;
pub mod notify;
pub mod orchestration;
pub mod scoring;
pub mod state;
pub mod util;

pub use error::{Error, Result};
pub use orchestration::{ControlHandle, Orchestrator, RunSummary};
