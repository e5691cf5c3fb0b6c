use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::ids::{DelayId, EnvironmentId, RunId, StepId, WorkflowId};

/// Lifecycle of a single workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failure,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Running => "RUNNING",
            StepStatus::Success => "SUCCESS",
            StepStatus::Failure => "FAILURE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::Failure)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(StepStatus::Pending),
            "RUNNING" => Ok(StepStatus::Running),
            "SUCCESS" => Ok(StepStatus::Success),
            "FAILURE" => Ok(StepStatus::Failure),
            other => Err(ModelError::UnknownStatus {
                kind: "step",
                value: other.to_owned(),
            }),
        }
    }
}

/// Lifecycle of a workflow run as reported by its host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failure => "FAILURE",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RunStatus::Pending),
            "RUNNING" => Ok(RunStatus::Running),
            "SUCCESS" => Ok(RunStatus::Success),
            "FAILURE" => Ok(RunStatus::Failure),
            other => Err(ModelError::UnknownStatus {
                kind: "run",
                value: other.to_owned(),
            }),
        }
    }
}

/// What a step represents inside its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    DurableDelay,
    LogMessage,
    CustomEvent,
    IntegrationRequest,
    FetchRequest,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::DurableDelay => "DURABLE_DELAY",
            StepKind::LogMessage => "LOG_MESSAGE",
            StepKind::CustomEvent => "CUSTOM_EVENT",
            StepKind::IntegrationRequest => "INTEGRATION_REQUEST",
            StepKind::FetchRequest => "FETCH_REQUEST",
        }
    }
}

impl FromStr for StepKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DURABLE_DELAY" => Ok(StepKind::DurableDelay),
            "LOG_MESSAGE" => Ok(StepKind::LogMessage),
            "CUSTOM_EVENT" => Ok(StepKind::CustomEvent),
            "INTEGRATION_REQUEST" => Ok(StepKind::IntegrationRequest),
            "FETCH_REQUEST" => Ok(StepKind::FetchRequest),
            other => Err(ModelError::UnknownStatus {
                kind: "step kind",
                value: other.to_owned(),
            }),
        }
    }
}

/// A unit of workflow execution. Only the step coordinator and the run
/// execution engine move a step between statuses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: StepId,
    pub run_id: RunId,
    /// Caller-supplied idempotency key, unique per run.
    pub key: String,
    pub kind: StepKind,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// The run context a step belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunRef {
    pub id: RunId,
    pub workflow_id: WorkflowId,
    pub environment_id: EnvironmentId,
    pub status: RunStatus,
}

/// A persisted, resolvable timer gating a step.
///
/// `resolved_at` is write-once: once set it never changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurableDelay {
    pub id: DelayId,
    pub step_id: StepId,
    pub wait_seconds: i64,
    pub resolve_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DurableDelay {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// A delay loaded together with its owning step and the step's run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayRecord {
    pub delay: DurableDelay,
    pub step: WorkflowStep,
    pub run: WorkflowRunRef,
}

/// A wait request issued by a workflow step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Wait {
    Delay {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seconds: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        minutes: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hours: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        days: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    ScheduleFor { scheduled_for: DateTime<Utc> },
}

impl Wait {
    pub fn seconds(seconds: u64) -> Self {
        Wait::Delay {
            seconds: Some(seconds),
            minutes: None,
            hours: None,
            days: None,
        }
    }

    /// The instant at which a wait issued at `from` is due.
    pub fn resolve_at(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Wait::Delay {
                seconds,
                minutes,
                hours,
                days,
            } => {
                let total = seconds
                    .unwrap_or(0)
                    .saturating_add(minutes.unwrap_or(0).saturating_mul(60))
                    .saturating_add(hours.unwrap_or(0).saturating_mul(3_600))
                    .saturating_add(days.unwrap_or(0).saturating_mul(86_400));
                let span = i64::try_from(total)
                    .ok()
                    .and_then(Duration::try_seconds)
                    .unwrap_or(Duration::MAX);
                from.checked_add_signed(span)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC)
            }
            Wait::ScheduleFor { scheduled_for } => (*scheduled_for).max(from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn delay_wait_sums_all_units() {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let wait = Wait::Delay {
            seconds: Some(30),
            minutes: Some(1),
            hours: Some(1),
            days: Some(1),
        };
        assert_eq!(
            wait.resolve_at(from),
            Utc.with_ymd_and_hms(2024, 1, 2, 1, 1, 30).unwrap()
        );
    }

    #[test]
    fn schedule_in_the_past_resolves_immediately() {
        let from = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let wait = Wait::ScheduleFor {
            scheduled_for: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
        };
        assert_eq!(wait.resolve_at(from), from);
    }

    #[test]
    fn wait_uses_tagged_wire_shape() {
        let wait: Wait =
            serde_json::from_str(r#"{"type":"DELAY","minutes":5}"#).unwrap();
        assert_eq!(
            wait,
            Wait::Delay {
                seconds: None,
                minutes: Some(5),
                hours: None,
                days: None
            }
        );

        let scheduled: Wait = serde_json::from_str(
            r#"{"type":"SCHEDULE_FOR","scheduledFor":"2030-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(matches!(scheduled, Wait::ScheduleFor { .. }));
    }

    #[test]
    fn statuses_round_trip_through_text() {
        for status in [
            StepStatus::Pending,
            StepStatus::Running,
            StepStatus::Success,
            StepStatus::Failure,
        ] {
            assert_eq!(status.as_str().parse::<StepStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<RunStatus>().is_err());
    }
}
