//! Application-level error taxonomy for the ingest facade, event processor,
//! and worker supervisor. Mirrors `event_bus::BusError` in shape: typed
//! variants instead of strings, with an `IntoResponse` impl so axum handlers
//! keep the `Result<T, E>` signature the teacher's `routes/health.rs` and
//! `idempotency.rs` use.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("validation failed")]
    Validation(Vec<String>),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("event bus error: {0}")]
    Bus(#[from] event_bus::BusError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        match self {
            IngestError::Validation(messages) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "validation_error", "messages": messages })),
            )
                .into_response(),
            IngestError::Database(e) => {
                tracing::error!(error = %e, "ingest database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal_error", "messages": ["unexpected server error"] })),
                )
                    .into_response()
            }
            IngestError::Bus(e) => {
                tracing::error!(error = %e, "ingest bus error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal_error", "messages": ["unexpected server error"] })),
                )
                    .into_response()
            }
            IngestError::Internal(msg) => {
                tracing::error!(error = %msg, "ingest internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal_error", "messages": [msg] })),
                )
                    .into_response()
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("decode error: {0}")]
    Decode(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("event bus error: {0}")]
    Bus(#[from] event_bus::BusError),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("event bus error: {0}")]
    Bus(#[from] event_bus::BusError),

    #[error("process error: {0}")]
    Process(#[from] ProcessError),
}
