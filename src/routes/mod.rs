pub mod events;
pub mod health;
pub mod metrics;
pub mod system;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/events", post(events::ingest_event))
        .route("/api/v1/events/{event_id}/status", get(events::event_status))
        .route("/api/v1/metrics", get(metrics::render_metrics))
        .route("/api/v1/health", get(health::health))
        .route("/api/v1/system/info", get(system::system_info))
        .route("/api/v1/system/queue-stats", get(system::queue_stats))
        .route("/api/v1/system/circuit-breakers", get(system::circuit_breakers))
        .with_state(state)
}
