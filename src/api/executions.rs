/// Execution status, step log and cancellation endpoints

use crate::api::{ApiError, AppState};
use crate::store::executions::{ExecutionRecord, ExecutionStep};
use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, post},
    Router,
};

pub fn create_execution_routes() -> Router<AppState> {
    Router::new()
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/executions/{id}/steps", get(list_steps))
        .route("/api/executions/{id}/cancel", post(cancel_execution))
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionRecord>, ApiError> {
    Ok(Json(state.engine.get_execution_status(&id).await?))
}

async fn list_steps(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ExecutionStep>>, ApiError> {
    Ok(Json(state.engine.list_execution_steps(&id).await?))
}

/// Request cancellation; the response shows the status at the time of the request
async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionRecord>, ApiError> {
    Ok(Json(state.engine.cancel_execution(&id).await?))
}
