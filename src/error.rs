//! Error types for the cuboid materialization engine.
//!
//! The taxonomy mirrors how errors actually flow through the system:
//! configuration errors (`InvalidSpec`) surface at registration time,
//! compute errors are transient and recoverable by retrying a refresh,
//! and `NotFound` covers lookups of unregistered specs or artifacts
//! that have not been populated yet.

use thiserror::Error;

/// The primary error type for cuboid operations.
#[derive(Error, Debug)]
pub enum CuboidError {
    /// Spec validation error (configuration-time, unrecoverable without
    /// fixing the spec)
    #[error("Invalid spec: {message}")]
    InvalidSpec { message: String },

    /// Unknown spec id or unpopulated artifact
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// Aggregation failure (source query failed or returned data that
    /// does not match the declared model) — transient, retry the refresh
    #[error("Compute error: {message}")]
    Compute { message: String },

    /// Schema error (column not found, wrong type in the star schema)
    #[error("Schema error: {message}")]
    Schema { message: String },

    /// Type error (value does not match its declared data type)
    #[error("Type error: {message}")]
    Type { message: String },

    /// I/O error from the persistence layer
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// State serialization/deserialization error
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Internal error (bug in the engine)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CuboidError {
    /// Create an invalid-spec error.
    pub fn invalid_spec(message: impl Into<String>) -> Self {
        Self::InvalidSpec {
            message: message.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a compute error.
    pub fn compute(message: impl Into<String>) -> Self {
        Self::Compute {
            message: message.into(),
        }
    }

    /// Create a schema error.
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    /// Create a type error.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::Type {
            message: message.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for CuboidError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

/// Result type alias for cuboid operations.
pub type Result<T> = std::result::Result<T, CuboidError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CuboidError::invalid_spec("unknown dimension 'region'");
        assert_eq!(err.to_string(), "Invalid spec: unknown dimension 'region'");

        let err = CuboidError::compute("source scan failed");
        assert_eq!(err.to_string(), "Compute error: source scan failed");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: CuboidError = io.into();
        assert!(matches!(err, CuboidError::Io { .. }));
    }
}
