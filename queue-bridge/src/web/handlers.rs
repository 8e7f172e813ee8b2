//! HTTP endpoint handlers.
//!
//! These handlers are deliberately thin: validation and broker handling live
//! in the producer adapter, the handlers only translate outcomes to HTTP.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::producer::{ProducerAdapter, SendError};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub producer: ProducerAdapter,
}

impl AppState {
    pub fn new(producer: ProducerAdapter) -> Self {
        Self { producer }
    }
}

/// Build the producer router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/send", get(send_message))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub broker_connected: bool,
}

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        broker_connected: state.producer.is_connected().await,
    })
}

// =============================================================================
// Send
// =============================================================================

/// Query string for `/send`.
#[derive(Debug, Default, Deserialize)]
pub struct SendQuery {
    pub msg: Option<String>,
}

/// Error body, shaped like `{"detail": "..."}`.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub detail: String,
}

impl IntoResponse for SendError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        (
            status,
            Json(ErrorResponse {
                detail: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Publish the `msg` query parameter to the queue.
///
/// Returns 200 with `{message, status}`, 400 for a missing or empty message,
/// 503 when no broker session can be opened and 500 when the publish fails.
pub async fn send_message(
    State(state): State<AppState>,
    Query(query): Query<SendQuery>,
) -> Response {
    info!(
        has_message = query.msg.is_some(),
        message_length = query.msg.as_ref().map(|s| s.len()).unwrap_or(0),
        "send_request_received"
    );

    match state.producer.send(query.msg.as_deref()).await {
        Ok(receipt) => (StatusCode::OK, Json(receipt)).into_response(),
        Err(e) => e.into_response(),
    }
}
