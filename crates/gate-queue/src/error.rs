//! Error types for gate-queue
//!
//! Admission rejections are not errors; they are reported through
//! [`crate::manager::RejectReason`]. This type covers configuration,
//! lookup and driver failures.

use thiserror::Error;

/// Core error type for gate-queue operations
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration failed validation
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Configuration could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// No source is registered under the connection name
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    /// Queue item, queue or bundle not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// The source driver reported a failure
    #[error("Source error on connection '{connection}': {message}")]
    Source {
        /// Connection whose driver failed
        connection: String,
        /// Driver-supplied description
        message: String,
    },

    /// A driver call exceeded the configured deadline
    #[error("Source call timed out after {millis} ms")]
    Timeout {
        /// The deadline that elapsed
        millis: u64,
    },

    /// Filesystem errors while loading configuration
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Status snapshot could not be rendered
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a source error for a connection.
    pub fn source_failure(connection: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Source {
            connection: connection.into(),
            message: message.into(),
        }
    }

    /// Whether this error came from talking to a driver (failure or timeout).
    #[must_use]
    pub const fn is_driver_failure(&self) -> bool {
        matches!(self, Self::Source { .. } | Self::Timeout { .. })
    }
}

/// Result type alias for gate-queue operations
pub type Result<T> = std::result::Result<T, Error>;
