use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// §6 `/api/v1/health`: 200 when broker, stream, and event store are all
/// reachable, 503 otherwise.
pub async fn health(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    sqlx::query("SELECT 1").fetch_one(&state.db).await.map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    if !state.pool.broker.is_connected() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    state.pool.stream.ping().await.map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    Ok(Json(json!({
        "status": "ok",
        "database": "connected",
        "broker": "connected",
        "stream": "connected",
    })))
}
