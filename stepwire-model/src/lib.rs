//! Core data model definitions shared across stepwire crates.
#![allow(missing_docs)]

pub use ::chrono;

pub mod error;
pub mod events;
pub mod ids;
pub mod rpc;
pub mod source;
pub mod workflow;

// Intentionally curated re-exports for downstream consumers.
pub use error::{ModelError, Result as ModelResult};
pub use events::{
    DelayResolved, ExternalSourceUpserted, ResolveDelay, TaskProperties,
};
pub use ids::{
    ApiConnectionId, DelayId, EnvironmentId, ExternalSourceId, RunId, StepId,
    WorkflowId,
};
pub use source::{Environment, ExternalSource, ExternalSourceStatus};
pub use workflow::{
    DelayRecord, DurableDelay, RunStatus, StepKind, StepStatus, Wait,
    WorkflowRunRef, WorkflowStep,
};
