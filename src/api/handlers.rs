//! HTTP request handlers

use super::sse::prompt_stream;
use super::types::{ErrorResponse, EventResponse, StatsResponse, StreamQuery};
use super::AppState;
use crate::runtime::{DispatchError, StateStore, StoreError};
use crate::state_machine::{ConversationState, InboundEvent};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Inbound events from the transport
        .route("/api/events", post(submit_event))
        // Inspection
        .route("/api/users/:user_id/state", get(get_user_state))
        .route("/api/stats", get(get_stats))
        // Every outbound prompt, including background notifications
        .route("/api/prompts/stream", get(stream_prompts))
        // Version
        .route("/version", get(get_version))
        .with_state(state)
}

// ============================================================
// Events
// ============================================================

async fn submit_event(
    State(state): State<AppState>,
    Json(event): Json<InboundEvent>,
) -> Result<Json<EventResponse>, AppError> {
    if event.event_id.trim().is_empty() {
        return Err(AppError::BadRequest("event_id is required".to_string()));
    }
    let prompts = state.runtime.dispatch(event).await?;
    Ok(Json(EventResponse { prompts }))
}

// ============================================================
// Inspection
// ============================================================

async fn get_user_state(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<ConversationState>, AppError> {
    state
        .runtime
        .store()
        .load(&user_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("No active flow for user {user_id}")))
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, AppError> {
    let flows = state.runtime.store().count_active_by_flow().await?;
    let total_active = flows.iter().map(|c| c.active).sum();
    Ok(Json(StatsResponse {
        flows,
        total_active,
        active_workers: state.runtime.active_workers().await,
    }))
}

async fn stream_prompts(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    prompt_stream(state.runtime.subscribe(), query.user_id)
}

async fn get_version() -> &'static str {
    concat!("chatflow ", env!("CARGO_PKG_VERSION"))
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    NotFound(String),
    Overloaded(String),
    Unavailable(String),
    Internal(String),
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Overloaded { .. } => AppError::Overloaded(err.to_string()),
            DispatchError::WorkerGone { .. } => AppError::Unavailable(err.to_string()),
            // Details are in the logs; callers get a neutral message
            DispatchError::Machine(_) => AppError::Internal("Internal error".to_string()),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(_) | StoreError::ConcurrentModification { .. } => {
                AppError::Unavailable(err.to_string())
            }
            StoreError::Corrupt(_) => AppError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Overloaded(msg) => (StatusCode::TOO_MANY_REQUESTS, msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}
