use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

pub async fn system_info() -> Json<Value> {
    Json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn circuit_breakers(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "breakers": state.breakers.snapshots() }))
}

pub async fn queue_stats(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let dlq_stats = state.dlq.stats().await.map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let normal_pending = state
        .pool
        .stream
        .pending_count(event_bus::stream::STREAM_NORMAL)
        .await
        .unwrap_or(0);
    let high_pending = state
        .pool
        .stream
        .pending_count(event_bus::stream::STREAM_HIGH)
        .await
        .unwrap_or(0);

    Ok(Json(json!({
        "stream_pending": { "normal": normal_pending, "high": high_pending },
        "dlq_kv_backup_count": dlq_stats.kv_backup_count,
    })))
}
