/// Human approval decision endpoint

use crate::api::{ApiError, AppState};
use crate::store::approvals::ApprovalTask;
use axum::{
    extract::{Path, State},
    response::Json,
    routing::post,
    Router,
};
use serde::Deserialize;

/// Request body for a decision
#[derive(Debug, Deserialize)]
pub struct ApprovalDecision {
    pub approved: bool,
    #[serde(default)]
    pub comment: Option<String>,
}

pub fn create_approval_routes() -> Router<AppState> {
    Router::new().route("/api/approvals/{task_id}", post(decide))
}

/// POST /api/approvals/{task_id}
/// Body: { "approved": true, "comment": "..." }
async fn decide(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(decision): Json<ApprovalDecision>,
) -> Result<Json<ApprovalTask>, ApiError> {
    let task = state
        .engine
        .decide_approval(&task_id, decision.approved, decision.comment)
        .await?;
    Ok(Json(task))
}
