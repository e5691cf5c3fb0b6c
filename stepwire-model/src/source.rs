use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::ids::{ApiConnectionId, EnvironmentId, ExternalSourceId};

/// Registration state of an external event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExternalSourceStatus {
    Created,
    Ready,
    Cancelled,
}

impl ExternalSourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalSourceStatus::Created => "CREATED",
            ExternalSourceStatus::Ready => "READY",
            ExternalSourceStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ExternalSourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExternalSourceStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(ExternalSourceStatus::Created),
            "READY" => Ok(ExternalSourceStatus::Ready),
            "CANCELLED" => Ok(ExternalSourceStatus::Cancelled),
            other => Err(ModelError::UnknownStatus {
                kind: "external source",
                value: other.to_owned(),
            }),
        }
    }
}

/// An integration-backed event source. Connecting it to an API connection
/// is what lets the integration start delivering events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalSource {
    pub id: ExternalSourceId,
    pub service: String,
    pub status: ExternalSourceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<ApiConnectionId>,
    pub updated_at: DateTime<Utc>,
}

/// A deployment environment; workflow hosts authenticate against one.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub id: EnvironmentId,
    pub slug: String,
    pub api_key: String,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("id", &self.id)
            .field("slug", &self.slug)
            .field("api_key", &"<redacted>")
            .finish()
    }
}
