use std::fmt::{self, Display};

/// Errors produced by model constructors and validation routines.
#[derive(Debug)]
pub enum ModelError {
    InvalidId { kind: &'static str, value: String },
    UnknownStatus { kind: &'static str, value: String },
    InvalidTimestamp(chrono::ParseError),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::InvalidId { kind, value } => {
                write!(f, "invalid {kind} id: {value:?}")
            }
            ModelError::UnknownStatus { kind, value } => {
                write!(f, "unknown {kind} status: {value}")
            }
            ModelError::InvalidTimestamp(err) => {
                write!(f, "invalid timestamp: {err}")
            }
        }
    }
}

impl std::error::Error for ModelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ModelError::InvalidTimestamp(err) => Some(err),
            ModelError::InvalidId { .. } | ModelError::UnknownStatus { .. } => {
                None
            }
        }
    }
}

impl From<chrono::ParseError> for ModelError {
    fn from(err: chrono::ParseError) -> Self {
        ModelError::InvalidTimestamp(err)
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;
