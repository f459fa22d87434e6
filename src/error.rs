//! Error types for the performance optimization layer

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the optimization layer
///
/// The enum is `Clone` so one failed fetch can be handed to every caller
/// waiting on the same in-flight request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Structurally invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Fallback or request function failed
    #[error("Fetch failed for key {key}: {reason}")]
    FetchFailed { key: String, reason: String },

    /// A cache tier could not be reached
    #[error("Cache tier {tier} unavailable: {reason}")]
    TierUnavailable { tier: String, reason: String },

    /// Operation attempted on a destroyed component
    #[error("{0} has been destroyed")]
    Destroyed(&'static str),

    /// Serialization or deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Compression Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    /// Operation did not complete in time
    #[error("Timed out after {millis}ms: {operation}")]
    Timeout { operation: String, millis: u64 },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a fetch failure for a key from any displayable cause
    pub fn fetch(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::FetchFailed {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Build an L2 unavailability error
    pub fn l2_unavailable(reason: impl std::fmt::Display) -> Self {
        Error::TierUnavailable {
            tier: "L2".into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::l2_unavailable(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::fetch("user:1", "boom");
        assert_eq!(err.to_string(), "Fetch failed for key user:1: boom");

        let err = Error::Destroyed("MultiLevelCache");
        assert_eq!(err.to_string(), "MultiLevelCache has been destroyed");
    }

    #[test]
    fn test_error_is_cloneable() {
        let err = Error::l2_unavailable("connection refused");
        assert_eq!(err.clone(), err);
    }

    #[test]
    fn test_json_error_conversion() {
        let parsed: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parsed.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
