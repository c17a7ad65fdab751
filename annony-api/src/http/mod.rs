// HTTP/WebSocket API for a chat instance

pub mod error;
pub mod health;
pub mod messages;
pub mod websocket;

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use annony_cluster::sync::{ClusterManager, ConnectionRegistry};

use crate::impls::messaging::MessageService;

pub use error::{AppError, AppResult};

/// Path of the chat stream when none is configured
pub const DEFAULT_STREAM_PATH: &str = "/socket";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub message_service: Arc<MessageService>,
    pub registry: Arc<ConnectionRegistry>,
    pub cluster: Arc<ClusterManager>,
    pub stream_path: String,
}

/// Create the HTTP router: `GET /messages`, the stream endpoint and health checks
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(messages::create_messages_router())
        .merge(health::create_health_router())
        .route(&state.stream_path, get(websocket::websocket_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
