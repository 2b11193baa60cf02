//! HTTP request handlers

use super::sse::sse_stream;
use super::types::{AgentRequestBody, CancelResponse, ErrorResponse, ThreadResponse};
use super::AppState;
use crate::runtime::{RequestError, CANCELLED};
use crate::translator::encode_history;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Streaming turns and approval decisions
        .route("/api/agent", post(run_agent))
        // Thread inspection
        .route("/api/threads/:id", get(get_thread))
        // Abandon a pending approval
        .route("/api/threads/:id/cancel", post(cancel_thread))
        .with_state(state)
}

// ============================================================
// Agent
// ============================================================

async fn run_agent(
    State(state): State<AppState>,
    Json(body): Json<AgentRequestBody>,
) -> Result<Response, AppError> {
    let request = body.into_request();
    let session = state.orchestrator.handle(request).await?;
    tracing::debug!(thread_id = %session.thread_id, "Streaming session");
    Ok(sse_stream(session).into_response())
}

// ============================================================
// Threads
// ============================================================

async fn get_thread(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ThreadResponse>, AppError> {
    let snapshot = state.orchestrator.snapshot(&id).await?;

    Ok(Json(ThreadResponse {
        thread_id: snapshot.thread_id,
        status: snapshot.status,
        pending_tool_call: snapshot.checkpoint.map(|c| c.pending),
        messages: encode_history(&snapshot.history),
    }))
}

async fn cancel_thread(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, AppError> {
    let session = state.orchestrator.cancel(&id, CANCELLED).await?;
    let (_, final_state) = session.finish().await?;

    Ok(Json(CancelResponse {
        ok: true,
        status: final_state.status(),
    }))
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl From<RequestError> for AppError {
    fn from(error: RequestError) -> Self {
        let message = error.to_string();
        match error {
            RequestError::EmptyRequest => AppError::BadRequest(message),
            RequestError::NoCheckpoint(_) | RequestError::ThreadNotFound(_) => {
                AppError::NotFound(message)
            }
            RequestError::CheckpointConflict(_)
            | RequestError::DecisionMismatch { .. }
            | RequestError::ThreadBusy(_)
            | RequestError::ThreadTerminated { .. } => AppError::Conflict(message),
            RequestError::HistoryInvariantViolation(_)
            | RequestError::Internal(_)
            | RequestError::Storage(_) => {
                tracing::error!(error = %message, "Request failed");
                AppError::Internal(message)
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}
