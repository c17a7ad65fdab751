//! Error types for cluster module

use thiserror::Error;

/// Cluster error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Bus unreachable while establishing the initial connection
    #[error("Bus unavailable: {0}")]
    BusUnavailable(String),

    /// Bus connection lost or publish queue saturated at runtime
    #[error("Bus disconnected: {0}")]
    BusDisconnected(String),

    #[error("Connection rejected: {0}")]
    ConnectionRejected(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<Error> for annony_core::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::BusUnavailable(msg) => Self::BusUnavailable(msg),
            Error::BusDisconnected(msg) | Error::Timeout(msg) => Self::BusDisconnected(msg),
            Error::Configuration(msg) => Self::Configuration(msg),
            Error::Serialization(msg) | Error::ConnectionRejected(msg) => Self::Internal(msg),
        }
    }
}

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, Error>;
