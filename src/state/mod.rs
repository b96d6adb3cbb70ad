//! Durable state: the task store and the workspace registry.
//!
//! Both are JSON files in the state directory, rewritten atomically on
//! every mutation.

mod registry;
mod store;

pub use registry::{ReviewRecord, WorkspaceRecord, WorkspaceRegistry, WorkspaceState, REGISTRY_FILE};
pub use store::{SharedStore, TaskStore, STORE_FILE};
