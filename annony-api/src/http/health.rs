//! Health check endpoints
//!
//! `/health` answers as long as the process serves HTTP; `/health/ready`
//! also requires a connected message bus.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};

use crate::http::AppState;

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/ready", get(readiness_check))
}

/// Basic health check (always returns OK if server is running)
pub async fn health_check() -> impl IntoResponse {
    "OK"
}

pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.cluster.is_bus_connected() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "BUS DISCONNECTED")
    }
}
