//! Payloads carried on the coordinating server's task queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{DelayId, ExternalSourceId, RunId, StepId};

/// An external source gained (or changed) its API connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalSourceUpserted {
    pub id: ExternalSourceId,
}

/// Request to resolve a durable delay once its wait has elapsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveDelay {
    pub id: DelayId,
}

/// A durable delay was resolved and its step completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayResolved {
    pub id: DelayId,
    pub step_id: StepId,
    pub run_id: RunId,
    pub resolved_at: DateTime<Utc>,
}

/// Routing headers shared by every task-queue message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProperties {
    #[serde(
        rename = "x-environment-id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub environment_id: Option<String>,
    #[serde(
        rename = "x-workflow-id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub workflow_id: Option<String>,
}
