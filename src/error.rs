//! Error types for trading memory

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for trading memory
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Input errors
    #[error("Validation failed for {field}: {message}")]
    Validation { field: String, message: String },

    // Storage errors (transient)
    #[error("Storage connection failed: {0}")]
    StorageConnection(String),

    #[error("Storage operation timed out after {0}ms")]
    StorageTimeout(u64),

    // Storage errors (permanent)
    #[error("Storage error: {0}")]
    Storage(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // Lifecycle
    #[error("Operation cancelled")]
    Cancelled,

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Shorthand for a validation failure on a named field
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StorageConnection(_) | Error::StorageTimeout(_))
    }

    /// Check if this error was caused by bad caller input
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation { .. })
    }

    /// Check if this error came from the storage layer
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Error::StorageConnection(_) | Error::StorageTimeout(_) | Error::Storage(_)
        )
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            Error::Deserialization(e.to_string())
        } else {
            Error::Serialization(e.to_string())
        }
    }
}

// Conversion from redis errors (connection-level failures are transient)
impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        if e.is_timeout()
            || e.is_connection_dropped()
            || e.is_connection_refusal()
            || e.is_io_error()
        {
            Error::StorageConnection(e.to_string())
        } else {
            Error::Storage(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::StorageConnection("refused".into()).is_retryable());
        assert!(Error::StorageTimeout(5000).is_retryable());
        assert!(!Error::Storage("WRONGTYPE".into()).is_retryable());
        assert!(!Error::validation("symbol", "empty").is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn test_validation_display() {
        let err = Error::validation("confidence", "must be between 1 and 100");
        assert!(err.is_validation());
        assert_eq!(
            err.to_string(),
            "Validation failed for confidence: must be between 1 and 100"
        );
    }

    #[test]
    fn test_serde_error_maps_to_deserialization() {
        let err: Error = serde_json::from_str::<u32>("\"nope\"").unwrap_err().into();
        assert!(matches!(err, Error::Deserialization(_)));
    }
}
