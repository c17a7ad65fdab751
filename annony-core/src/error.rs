use thiserror::Error;

/// Failures surfaced by the relay.
///
/// Each variant maps to exactly one client-visible shape; internal detail
/// carried in the payload is logged and never sent to clients.
#[derive(Error, Debug)]
pub enum Error {
    /// Rate limiter refused the request.
    #[error("Admission denied for {key}")]
    AdmissionDenied { key: String, retry_after_seconds: u64 },

    /// The gateway could not reach a message instance.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Appending to or reading from the history store failed.
    #[error("Persistence failure: {0}")]
    Persistence(String),

    /// The bus could not be reached at startup. Fatal.
    #[error("Message bus unavailable at startup: {0}")]
    BusUnavailable(String),

    /// The bus dropped at runtime. Recoverable; messages in flight may be lost.
    #[error("Message bus disconnected: {0}")]
    BusDisconnected(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Persistence(format!("migration failed: {err}"))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl Error {
    /// Whether the error should abort process startup.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::BusUnavailable(_) | Self::Configuration(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::BusUnavailable("refused".into()).is_fatal());
        assert!(Error::Configuration("bad port".into()).is_fatal());
        assert!(!Error::BusDisconnected("reset".into()).is_fatal());
        assert!(!Error::Persistence("timeout".into()).is_fatal());
    }

    #[test]
    fn test_sqlx_error_maps_to_persistence() {
        let err: Error = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, Error::Persistence(_)));
    }
}
