use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use stepwire_model::rpc::WorkflowError;
use stepwire_model::{
    ApiConnectionId, DelayId, DelayRecord, Environment, ExternalSource,
    ExternalSourceId, RunId, StepKind, Wait, WorkflowStep,
};

use crate::error::StoreError;

/// Result of marking a delay resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum DelayResolution {
    /// This call set `resolved_at` and completed the step.
    Resolved(DelayRecord),
    /// Someone else resolved it first; the stored record is returned as-is.
    AlreadyResolved(DelayRecord),
}

impl DelayResolution {
    pub fn record(&self) -> &DelayRecord {
        match self {
            DelayResolution::Resolved(record)
            | DelayResolution::AlreadyResolved(record) => record,
        }
    }

    pub fn into_record(self) -> DelayRecord {
        match self {
            DelayResolution::Resolved(record)
            | DelayResolution::AlreadyResolved(record) => record,
        }
    }
}

/// A step reported by a workflow host.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStep {
    pub run_id: RunId,
    pub key: String,
    pub kind: StepKind,
    pub input: Value,
    pub started_at: DateTime<Utc>,
    /// Steps that finish as they are recorded (logs, events).
    pub completed: bool,
}

/// Persistence port for runs, steps, delays and external sources.
///
/// Step writes are idempotent on `(run_id, key)`: recording the same step
/// twice returns the first record.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn find_delay(&self, id: &DelayId) -> Result<Option<DelayRecord>, StoreError>;

    /// Sets `resolved_at` and completes the owning step in one atomic write.
    async fn resolve_delay(
        &self,
        id: &DelayId,
        resolved_at: DateTime<Utc>,
    ) -> Result<DelayResolution, StoreError>;

    async fn connect_external_source(
        &self,
        source_id: &ExternalSourceId,
        connection_id: &ApiConnectionId,
    ) -> Result<ExternalSource, StoreError>;

    async fn find_environment_by_api_key(
        &self,
        api_key: &str,
    ) -> Result<Option<Environment>, StoreError>;

    async fn start_run(&self, run_id: &RunId, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn complete_run(
        &self,
        run_id: &RunId,
        output: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn fail_run(
        &self,
        run_id: &RunId,
        error: &WorkflowError,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Creates the step and its delay, or returns the existing pair.
    async fn record_delay_step(
        &self,
        run_id: &RunId,
        key: &str,
        wait: &Wait,
        requested_at: DateTime<Utc>,
    ) -> Result<DelayRecord, StoreError>;

    async fn record_step(&self, step: NewStep) -> Result<WorkflowStep, StoreError>;
}
