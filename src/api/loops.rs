/// Polling-loop status and control endpoints
///
/// Control actions answer `409 Conflict` when the loop's status does not allow them.

use crate::api::{ApiError, AppState};
use crate::store::loops::{LoopState, LoopStatusReport};
use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct LoopListQuery {
    pub execution_id: Option<String>,
}

pub fn create_loop_routes() -> Router<AppState> {
    Router::new()
        .route("/api/loops", get(list_active_loops))
        .route("/api/loops/{id}", get(get_loop))
        .route("/api/loops/{id}/{action}", post(control_loop))
}

async fn list_active_loops(
    State(state): State<AppState>,
    Query(query): Query<LoopListQuery>,
) -> Result<Json<Vec<LoopStatusReport>>, ApiError> {
    Ok(Json(
        state
            .engine
            .list_active_loops(query.execution_id.as_deref())
            .await?,
    ))
}

async fn get_loop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<LoopStatusReport>, ApiError> {
    Ok(Json(state.engine.get_loop_status(&id).await?))
}

/// POST /api/loops/{id}/{pause|resume|stop|retry}
async fn control_loop(
    State(state): State<AppState>,
    Path((id, action)): Path<(String, String)>,
) -> Result<Json<LoopState>, ApiError> {
    tracing::info!("🎛️ Loop control request: {} {}", action, id);
    let engine = &state.engine;
    let loop_state = match action.as_str() {
        "pause" => engine.pause_loop(&id).await?,
        "resume" => engine.resume_loop(&id).await?,
        "stop" => engine.stop_loop(&id).await?,
        "retry" => engine.retry_loop(&id).await?,
        other => return Err(ApiError::BadRequest(format!("unknown loop action '{other}'"))),
    };
    Ok(Json(loop_state))
}
