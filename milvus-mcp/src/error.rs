//! Error types for Milvus MCP

use crate::batch::BatchReport;
use serde::Serialize;
use thiserror::Error;

/// Coarse error category reported to callers in the tool result envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed, missing or mistyped arguments
    Validation,
    /// Operation unsupported by the backend or collection configuration
    Capability,
    /// Connection failure or an operation rejected by the backend
    Backend,
    /// Batched mutation stopped after some chunks were committed
    PartialFailure,
    /// Unknown tool name
    NotFound,
    /// Anything else (configuration, I/O, serialization, panics)
    Internal,
}

/// Milvus MCP error type
#[derive(Error, Debug)]
pub enum Error {
    /// Argument failed validation before any backend work happened
    #[error("Validation error for '{param}': {message}")]
    Validation { param: String, message: String },

    /// Requested operation is not available for this backend or collection
    #[error("Capability error: {0}")]
    Capability(String),

    /// Backend rejected the operation or could not be reached
    #[error("Backend error: {0}")]
    Backend(String),

    /// Batched mutation stopped at a failing chunk
    #[error("{0}")]
    PartialFailure(Box<BatchReport>),

    /// Tool is not registered
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Local database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for Milvus MCP operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a validation error naming the offending parameter
    pub fn validation(param: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            param: param.into(),
            message: message.into(),
        }
    }

    /// Create a backend error
    pub fn backend(message: impl Into<String>) -> Self {
        Error::Backend(message.into())
    }

    /// Create a capability error
    pub fn capability(message: impl Into<String>) -> Self {
        Error::Capability(message.into())
    }

    /// Category reported to the caller
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation { .. } => ErrorKind::Validation,
            Error::Capability(_) => ErrorKind::Capability,
            Error::Backend(_) | Error::Database(_) | Error::Http(_) => ErrorKind::Backend,
            // A batch that failed on its first chunk committed nothing
            Error::PartialFailure(report) if report.committed_rows == 0 => ErrorKind::Backend,
            Error::PartialFailure(_) => ErrorKind::PartialFailure,
            Error::ToolNotFound(_) => ErrorKind::NotFound,
            Error::Config(_) | Error::Io(_) | Error::Serialization(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::ToolNotFound("drop_everything".to_string());
        assert_eq!(err.to_string(), "Tool not found: drop_everything");

        let err = Error::validation("vector", "missing required parameter");
        assert_eq!(
            err.to_string(),
            "Validation error for 'vector': missing required parameter"
        );
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::validation("x", "y").kind(), ErrorKind::Validation);
        assert_eq!(Error::capability("no sparse").kind(), ErrorKind::Capability);
        assert_eq!(Error::backend("down").kind(), ErrorKind::Backend);
        assert_eq!(Error::ToolNotFound("t".into()).kind(), ErrorKind::NotFound);
        assert_eq!(Error::Config("dup".into()).kind(), ErrorKind::Internal);
    }
}
