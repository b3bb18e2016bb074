//! Error types for nodered-cluster

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Transport Errors ===
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    // === Payload Errors ===
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    // === Store Errors ===
    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    #[error("Write conflict on {0}: too many concurrent updates")]
    Conflict(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    // === Propagation Errors ===
    #[error("Reload failed: {0}")]
    Reload(String),

    #[error("Package install failed: {0}")]
    Install(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::ConnectionFailed(_) | Error::Timeout(_) | Error::Conflict(_)
        )
    }

    /// Did the failure happen on the connection rather than in the payload?
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::ConnectionFailed(_) | Error::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

#[cfg(feature = "redis-backend")]
impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else {
            Error::Transport(e.to_string())
        }
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(Error::Transport("reset".into()).is_retryable());
        assert!(Error::Timeout("get".into()).is_retryable());
        assert!(!Error::Serialization("bad".into()).is_retryable());
        assert!(!Error::NotLeader("hostA".into()).is_retryable());
    }

    #[test]
    fn test_serde_error_maps_to_serialization() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, Error::Serialization(_)));
        assert!(!err.is_connection_error());
    }
}
