//! Error types for Gatehouse services

use std::fmt;

/// Result type alias using GatehouseError
pub type Result<T> = std::result::Result<T, GatehouseError>;

/// Main error type for Gatehouse services
#[derive(Debug, thiserror::Error)]
pub enum GatehouseError {
    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Permission level does not allow the requested command
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Invalid request/argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Waiting for the database took too long
    #[error("Database timeout after {0} ms")]
    DatabaseTimeout(u64),

    /// TLS/Certificate error
    #[error("TLS error: {0}")]
    TlsError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Connection attempts from one address exceeded the flood threshold
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Service unavailable
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Socket or file I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatehouseError {
    /// Create an internal error from any error type
    pub fn internal<E: fmt::Display>(err: E) -> Self {
        GatehouseError::Internal(err.to_string())
    }

    /// Get the error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            GatehouseError::AuthenticationFailed(_) => "UNAUTHENTICATED",
            GatehouseError::PermissionDenied(_) => "PERMISSION_DENIED",
            GatehouseError::InvalidArgument(_) => "INVALID_ARGUMENT",
            GatehouseError::DatabaseError(_) => "DATABASE_ERROR",
            GatehouseError::DatabaseTimeout(_) => "DEADLINE_EXCEEDED",
            GatehouseError::TlsError(_) => "TLS_ERROR",
            GatehouseError::ConfigError(_) => "CONFIG_ERROR",
            GatehouseError::SerializationError(_) => "SERIALIZATION_ERROR",
            GatehouseError::RateLimited(_) => "RESOURCE_EXHAUSTED",
            GatehouseError::ServiceUnavailable(_) => "UNAVAILABLE",
            GatehouseError::Io(_) => "IO_ERROR",
            GatehouseError::Internal(_) => "INTERNAL",
        }
    }

    /// Whether the failure is local to one session and must not take the listener down
    pub fn is_session_scoped(&self) -> bool {
        matches!(
            self,
            GatehouseError::AuthenticationFailed(_)
                | GatehouseError::PermissionDenied(_)
                | GatehouseError::InvalidArgument(_)
                | GatehouseError::RateLimited(_)
                | GatehouseError::Io(_)
        )
    }
}

impl From<serde_json::Error> for GatehouseError {
    fn from(err: serde_json::Error) -> Self {
        GatehouseError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for GatehouseError {
    fn from(err: std::io::Error) -> Self {
        GatehouseError::Io(err.to_string())
    }
}

impl From<config::ConfigError> for GatehouseError {
    fn from(err: config::ConfigError) -> Self {
        GatehouseError::ConfigError(err.to_string())
    }
}
