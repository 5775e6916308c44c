//! Error types for the structuring detector

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the detector
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Reputation provider errors
    #[error("Reputation lookup failed for {subject}: {reason}")]
    LookupFailed { subject: String, reason: String },

    #[error("Reputation lookup timed out after {0}ms")]
    LookupTimeout(u64),

    // Aggregation errors
    #[error("Invariant guard: {0}")]
    InvariantGuard(String),

    // Sink errors
    #[error("Delivery to {sink} failed: {reason}")]
    DeliveryFailed { sink: String, reason: String },

    #[error("Delivery to {sink} timed out after {timeout_ms}ms")]
    DeliveryTimeout { sink: String, timeout_ms: u64 },

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is transient (a later call may succeed)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LookupFailed { .. }
                | Error::LookupTimeout(_)
                | Error::DeliveryFailed { .. }
                | Error::DeliveryTimeout { .. }
        )
    }

    /// Check if this error must be treated as a pass by the admission filter
    pub fn is_fail_open(&self) -> bool {
        matches!(self, Error::LookupFailed { .. } | Error::LookupTimeout(_))
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
