//! Message history endpoint

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use annony_core::models::Message;

use crate::http::{AppError, AppResult, AppState};

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

pub fn create_messages_router() -> Router<AppState> {
    Router::new().route("/messages", get(list_messages))
}

/// `GET /messages`: recent messages, oldest first
pub async fn list_messages(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<Vec<Message>>> {
    let limit = query
        .limit
        .unwrap_or_else(|| state.message_service.history_limit());

    let messages = state.message_service.history(limit).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to fetch messages");
        AppError::internal_server_error("Failed to fetch messages")
    })?;

    Ok(Json(messages))
}
