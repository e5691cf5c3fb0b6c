use std::fmt;

use thiserror::Error;

/// Which half of a catalog entry rejected a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaTarget {
    Data,
    Properties,
}

impl fmt::Display for SchemaTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaTarget::Data => f.write_str("data"),
            SchemaTarget::Properties => f.write_str("properties"),
        }
    }
}

#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Unknown message type: {message_type}")]
    UnknownMessageType { message_type: String },

    #[error("Message type registered twice: {message_type}")]
    DuplicateType { message_type: String },

    #[error("Invalid {target} for message type {message_type}: {reason}")]
    SchemaValidation {
        message_type: String,
        target: SchemaTarget,
        reason: String,
    },

    #[error("No handler registered for message type: {message_type}")]
    MissingHandler { message_type: String },

    #[error("Malformed message envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Subscriber not ready: {0}")]
    NotReady(String),
}

impl MessagingError {
    pub fn schema(
        message_type: impl Into<String>,
        target: SchemaTarget,
        reason: impl fmt::Display,
    ) -> Self {
        MessagingError::SchemaValidation {
            message_type: message_type.into(),
            target,
            reason: reason.to_string(),
        }
    }

    pub fn unknown(message_type: impl Into<String>) -> Self {
        MessagingError::UnknownMessageType {
            message_type: message_type.into(),
        }
    }

    /// Failures that will not change on redelivery.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            MessagingError::UnknownMessageType { .. }
                | MessagingError::SchemaValidation { .. }
                | MessagingError::MalformedEnvelope(_)
                | MessagingError::Serialization(_)
        )
    }
}

/// Error raised by a message handler while processing a delivery.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub retryable: bool,
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<CoordinatorError> for HandlerError {
    fn from(err: CoordinatorError) -> Self {
        let retryable = !matches!(err, CoordinatorError::NotFound { .. });
        Self {
            message: err.to_string(),
            retryable,
        }
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        let retryable = !matches!(err, StoreError::NotFound { .. });
        Self {
            message: err.to_string(),
            retryable,
        }
    }
}

/// Kind of record a lookup failed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Delay,
    Step,
    Run,
    ExternalSource,
    ApiConnection,
    Environment,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordKind::Delay => "delay",
            RecordKind::Step => "step",
            RecordKind::Run => "run",
            RecordKind::ExternalSource => "external source",
            RecordKind::ApiConnection => "api connection",
            RecordKind::Environment => "environment",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: RecordKind, id: String },

    #[error("Conflicting write on {kind} {id}: {reason}")]
    Conflict {
        kind: RecordKind,
        id: String,
        reason: String,
    },

    #[error("Database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn not_found(kind: RecordKind, id: impl fmt::Display) -> Self {
        StoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: RecordKind, id: String },

    #[error("Persistence failed for {kind} {id}: {source}")]
    Store {
        kind: RecordKind,
        id: String,
        #[source]
        source: StoreError,
    },

    /// State was committed but the follow-up event could not be published.
    #[error("Committed {kind} {id} but failed to publish {message_type}: {source}")]
    Notify {
        kind: RecordKind,
        id: String,
        message_type: &'static str,
        #[source]
        source: MessagingError,
    },
}

impl CoordinatorError {
    pub(crate) fn from_store(
        kind: RecordKind,
        id: impl fmt::Display,
        err: StoreError,
    ) -> Self {
        match err {
            StoreError::NotFound { kind, id } => {
                CoordinatorError::NotFound { kind, id }
            }
            other => CoordinatorError::Store {
                kind,
                id: id.to_string(),
                source: other,
            },
        }
    }
}

#[derive(Error, Debug)]
pub enum RpcError {
    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error("Response for {method} does not match its schema: {reason}")]
    InvalidResponse { method: String, reason: String },

    #[error("RPC client is closed")]
    Closed,
}

pub type Result<T, E = MessagingError> = std::result::Result<T, E>;
