use thiserror::Error;

use crate::event::{Category, EventKind};

/// Errors returned by the state engine.
///
/// Every public operation converts failures into one of these at its own
/// boundary; nothing here is fatal to the process.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported event kind {kind} for category {category}")]
    UnsupportedEventKind { category: Category, kind: EventKind },

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Parameter is read-only: {0}")]
    ReadOnly(String),

    #[error("State engine not initialized")]
    NotInitialized,
}

impl StateError {
    /// Short machine-readable tag, used in error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            StateError::MissingField(_) => "missing_field",
            StateError::NotFound(_) => "not_found",
            StateError::InvalidFormat(_) => "invalid_format",
            StateError::UnsupportedEventKind { .. } => "unsupported_event_kind",
            StateError::IoError(_) => "io_error",
            StateError::ParseError(_) => "parse_error",
            StateError::ReadOnly(_) => "read_only",
            StateError::NotInitialized => "not_initialized",
        }
    }
}

impl From<std::io::Error> for StateError {
    fn from(e: std::io::Error) -> Self {
        StateError::IoError(e.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(e: serde_json::Error) -> Self {
        StateError::ParseError(e.to_string())
    }
}
