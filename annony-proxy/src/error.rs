// Gateway error responses

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use annony_core::service::RATE_LIMIT_REASON;

pub type ProxyResult<T> = Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Core(#[from] annony_core::Error),

    #[error("Upstream handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
}

impl ProxyError {
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Core(annony_core::Error::UpstreamUnavailable(message.into()))
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
}

fn json_error(status: StatusCode, error: &'static str) -> Response {
    (status, Json(ErrorBody { error })).into_response()
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        use annony_core::Error;

        match self {
            Self::Core(Error::AdmissionDenied {
                key,
                retry_after_seconds,
            }) => {
                tracing::debug!(client = %key, retry_after_seconds, "Request rate limited");
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [("Retry-After", retry_after_seconds.to_string())],
                    RATE_LIMIT_REASON,
                )
                    .into_response()
            }
            Self::Core(Error::UpstreamUnavailable(msg)) => {
                tracing::error!("Proxy error: {}", msg);
                json_error(StatusCode::BAD_GATEWAY, "Proxy failed")
            }
            Self::Core(Error::InvalidInput(msg)) => {
                tracing::debug!("Rejected request: {}", msg);
                json_error(StatusCode::BAD_REQUEST, "Bad request")
            }
            Self::HandshakeTimeout(after) => {
                tracing::warn!(?after, "Upstream handshake timed out");
                json_error(StatusCode::GATEWAY_TIMEOUT, "Gateway timeout")
            }
            Self::Core(other) => {
                tracing::error!("Internal error: {}", other);
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        }
    }
}
