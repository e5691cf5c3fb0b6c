//! Resolution of workflow wait primitives and the persistence port behind it.

pub mod coordinator;
pub mod memory;
pub mod store;

pub use coordinator::StepCoordinator;
pub use memory::{InMemoryWorkflowStore, StoredRun};
#[cfg(test)]
pub use store::MockWorkflowStore;
pub use store::{DelayResolution, NewStep, WorkflowStore};
