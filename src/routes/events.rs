use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use uuid::Uuid;

use crate::errors::IngestError;
use crate::models::IngestEventRequest;
use crate::state::AppState;

pub async fn ingest_event(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IngestEventRequest>,
) -> Result<impl IntoResponse, IngestError> {
    let response = state.ingest.ingest(request).await?;
    let status = if response.cached.unwrap_or(false) { StatusCode::OK } else { StatusCode::ACCEPTED };
    Ok((status, Json(response)))
}

pub async fn event_status(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<Uuid>,
) -> Result<impl IntoResponse, IngestError> {
    match state.ingest.status(event_id).await? {
        Some(status) => Ok((StatusCode::OK, Json(status)).into_response()),
        None => Ok(StatusCode::NOT_FOUND.into_response()),
    }
}
