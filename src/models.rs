//! Wire and storage DTOs for the HTTP surface and the `events` table. The
//! in-flight domain type (`event_bus::Event`) stays back-end-agnostic; these
//! types are the boundary shapes axum and sqlx actually see.

use chrono::{DateTime, Utc};
use event_bus::{Event, EventSource, EventStatus, EventType};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct IngestEventRequest {
    pub user_id: Uuid,
    pub event_type: EventType,
    #[serde(default)]
    pub custom_type: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: JsonValue,
    #[serde(default)]
    pub metadata: Option<JsonValue>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl IngestEventRequest {
    pub fn into_event(self, id: Uuid) -> Event {
        let priority = self.priority.unwrap_or_else(|| self.event_type.default_priority());
        Event {
            id,
            user_id: self.user_id,
            event_type: self.event_type,
            custom_type: self.custom_type,
            timestamp: self.timestamp,
            payload: self.payload,
            metadata: self.metadata,
            priority,
            idempotency_key: self.idempotency_key,
            source: EventSource::Api,
            queue_message_id: None,
            status: EventStatus::Pending,
            retry_count: 0,
            last_error: None,
            processed_at: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct IngestEventResponse {
    pub success: bool,
    pub event_id: Uuid,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routed_to: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct EventStatusResponse {
    pub event_id: Uuid,
    pub status: EventStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_time: Option<EstimatedTime>,
}

#[derive(Debug, Serialize)]
pub struct EstimatedTime {
    pub seconds: u64,
    pub basis: &'static str,
}

/// Row shape for the `events` table (§6).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub event_type: String,
    pub custom_type: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub priority: i16,
    pub payload: JsonValue,
    pub metadata: Option<JsonValue>,
    pub source: String,
    pub queue_message_id: Option<String>,
    pub status: String,
    pub idempotency_key: Option<String>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_request(event_type: EventType) -> IngestEventRequest {
        IngestEventRequest {
            user_id: Uuid::now_v7(),
            event_type,
            custom_type: None,
            timestamp: chrono::Utc::now(),
            payload: JsonValue::Null,
            metadata: None,
            priority: None,
            idempotency_key: None,
        }
    }

    #[test]
    fn omitted_priority_falls_back_to_type_default() {
        let event = base_request(EventType::Purchase).into_event(Uuid::now_v7());
        assert_eq!(event.priority, 9);

        let event = base_request(EventType::Login).into_event(Uuid::now_v7());
        assert_eq!(event.priority, 5);

        let event = base_request(EventType::Click).into_event(Uuid::now_v7());
        assert_eq!(event.priority, 1);
    }

    #[test]
    fn explicit_priority_is_preserved_over_type_default() {
        let mut request = base_request(EventType::Click);
        request.priority = Some(9);
        let event = request.into_event(Uuid::now_v7());
        assert_eq!(event.priority, 9);
    }

    #[test]
    fn into_event_starts_pending_from_api_with_zero_retries() {
        let event = base_request(EventType::View).into_event(Uuid::now_v7());
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.source, EventSource::Api);
        assert_eq!(event.retry_count, 0);
    }
}
