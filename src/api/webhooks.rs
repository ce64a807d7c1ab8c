/// Webhook trigger endpoint
///
/// `ANY /webhook/{workflow_id}` turns an inbound request into an execution and answers
/// `202 Accepted` right away; the walk continues in the background.

use crate::api::{ApiError, AppState};
use crate::runtime::error::ExecutionError;
use crate::workflow::types::HttpMethod;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    response::Json,
    routing::{any, Router},
};
use serde_json::{json, Value};
use std::collections::HashMap;

pub fn create_webhook_routes() -> Router<AppState> {
    Router::new().route("/webhook/{workflow_id}", any(trigger_webhook))
}

/// Submit an event to a workflow
///
/// The JSON body becomes the event data; a request without a body uses its query
/// parameters instead. Request headers travel with the event.
async fn trigger_webhook(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    method: Method,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    tracing::info!("📥 Webhook request received: {} {}", method, workflow_id);

    let method: HttpMethod = method.as_str().parse().map_err(|_| {
        ApiError::Execution(ExecutionError::MethodNotAllowed {
            method: method.to_string(),
        })
    })?;

    let payload = if body.trim().is_empty() {
        json!(query)
    } else {
        serde_json::from_str(&body).map_err(|e| {
            tracing::warn!("❌ Invalid JSON payload for webhook {}: {}", workflow_id, e);
            ApiError::BadRequest(format!("invalid JSON body: {e}"))
        })?
    };

    let headers: HashMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();

    let execution_id = state
        .engine
        .submit_event(&workflow_id, payload, headers, method)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(json!({ "execution_id": execution_id }))))
}
