//! Error types shared by every gateway crate.

use thiserror::Error;

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway error kinds.
///
/// Registry operations surface `NotFound`, `Conflict` and `InvalidConfig`
/// to the caller. `Parse` and `Storage` raised inside the ingestion worker
/// are logged there and never leave it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Unknown instance, topic, schema or document.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate instance or duplicate topic subscription.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed broker address, non-positive period, bad path expression.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Connect, publish or subscribe failure reported by the broker transport.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Payload is not valid structured data.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Collection create or document write failure.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Short machine-readable kind label.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::InvalidConfig(_) => "invalid_config",
            Error::Transport(_) => "transport",
            Error::Parse(_) => "parse",
            Error::Storage(_) => "storage",
        }
    }

    /// The message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Error::NotFound(s)
            | Error::Conflict(s)
            | Error::InvalidConfig(s)
            | Error::Transport(s)
            | Error::Parse(s)
            | Error::Storage(s) => s,
        }
    }

    /// Rebuild an error from a [`kind`](Self::kind) label and message.
    /// Unknown labels become `Storage`.
    pub fn from_kind(kind: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            "not_found" => Error::NotFound(message),
            "conflict" => Error::Conflict(message),
            "invalid_config" => Error::InvalidConfig(message),
            "transport" => Error::Transport(message),
            "parse" => Error::Parse(message),
            _ => Error::Storage(message),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

impl From<crate::path::PathError> for Error {
    fn from(e: crate::path::PathError) -> Self {
        use crate::path::PathError;
        match e {
            PathError::Missing { .. } | PathError::IndexOutOfRange { .. } => {
                Error::NotFound(e.to_string())
            }
            PathError::Empty | PathError::Malformed(_) | PathError::NotContainer { .. } => {
                Error::InvalidConfig(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_reason() {
        let err = Error::NotFound("instance 'ghost'".to_string());
        assert_eq!(err.to_string(), "Not found: instance 'ghost'");
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_json_error_maps_to_parse() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), "parse");
    }

    #[test]
    fn test_kind_and_message_rebuild_error() {
        let err = Error::Conflict("instance 'a' is running".to_string());
        assert_eq!(Error::from_kind(err.kind(), err.message()), err);
        assert_eq!(Error::from_kind("mystery", "x"), Error::Storage("x".to_string()));
    }
}
