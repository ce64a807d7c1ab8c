/// HTTP API Layer
///
/// axum routes over the execution engine: the webhook trigger, execution status and
/// cancellation, polling-loop status and control, and approval decisions.

use crate::runtime::engine::ExecutionEngine;
use crate::runtime::error::{ExecutionError, LoopError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    Router,
};
use serde_json::json;

// Webhook trigger endpoint
pub mod webhooks;

// Execution status, step log and cancellation
pub mod executions;

// Polling-loop status and control
pub mod loops;

// Human approval decisions
pub mod approvals;

/// Shared state of every route
#[derive(Clone)]
pub struct AppState {
    pub engine: ExecutionEngine,
}

/// Error returned by API handlers, rendered as `{"error": ..., "class": ...}`
#[derive(Debug)]
pub enum ApiError {
    Execution(ExecutionError),
    Loop(LoopError),
    BadRequest(String),
}

impl From<ExecutionError> for ApiError {
    fn from(e: ExecutionError) -> Self {
        ApiError::Execution(e)
    }
}

impl From<LoopError> for ApiError {
    fn from(e: LoopError) -> Self {
        ApiError::Loop(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, class, message) = match &self {
            ApiError::Execution(e) => {
                let status = match e {
                    ExecutionError::WorkflowNotFound(_)
                    | ExecutionError::ExecutionNotFound(_)
                    | ExecutionError::ApprovalNotFound(_) => StatusCode::NOT_FOUND,
                    ExecutionError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
                    ExecutionError::ApprovalAlreadyDecided(_) => StatusCode::CONFLICT,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.class(), e.to_string())
            }
            ApiError::Loop(e) => {
                let status = match e {
                    LoopError::NotFound(_) => StatusCode::NOT_FOUND,
                    LoopError::InvalidTransition { .. } => StatusCode::CONFLICT,
                    LoopError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
                    LoopError::PersistenceFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.class(), e.to_string())
            }
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, "bad_request", message.clone()),
        };

        if status.is_server_error() {
            tracing::error!("❌ API error ({}): {}", class, message);
        } else {
            tracing::debug!("⚠️ API request rejected ({}): {}", class, message);
        }
        (status, Json(json!({ "error": message, "class": class }))).into_response()
    }
}

/// Every API route, ready for `with_state`
pub fn create_api_routes() -> Router<AppState> {
    Router::new()
        .merge(webhooks::create_webhook_routes())
        .merge(executions::create_execution_routes())
        .merge(loops::create_loop_routes())
        .merge(approvals::create_approval_routes())
}
