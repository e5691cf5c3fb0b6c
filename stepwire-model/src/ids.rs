use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ModelError, Result};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        #[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
        #[cfg_attr(feature = "sqlx", sqlx(transparent))]
        pub struct $name(String);

        impl $name {
            /// Wraps an identifier without validation. Prefer [`Self::parse`]
            /// for values that arrive from outside the process.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn parse(value: impl Into<String>) -> Result<Self> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(ModelError::InvalidId { kind: $kind, value });
                }
                Ok(Self(value))
            }

            pub fn generate() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Identifier of a single workflow run.
    RunId,
    "run"
);
string_id!(
    /// Identifier of a step within a workflow run.
    StepId,
    "step"
);
string_id!(
    /// Identifier of a durable delay gating a step.
    DelayId,
    "delay"
);
string_id!(
    /// Identifier of an external event source (webhook registration).
    ExternalSourceId,
    "external source"
);
string_id!(ApiConnectionId, "api connection");
string_id!(EnvironmentId, "environment");
string_id!(WorkflowId, "workflow");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_blank_identifiers() {
        assert!(DelayId::parse("d_1").is_ok());
        let err = DelayId::parse("  ").unwrap_err();
        assert!(err.to_string().contains("invalid delay id"));
    }

    #[test]
    fn ids_serialize_as_bare_strings() {
        let id = RunId::new("run_42");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"run_42\"");
        let back: RunId = serde_json::from_str("\"run_42\"").unwrap();
        assert_eq!(back, id);
    }
}
