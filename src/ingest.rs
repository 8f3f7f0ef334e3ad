//! Ingest facade (C8): validate, dedupe, route, push with breaker-gated
//! failover, and fall back to durable-but-failed persistence when both
//! back-ends refuse a publish.
//!
//! The duplicate-intake short-circuit is modeled as an explicit result kind
//! (`IngestOutcome::Duplicate`) rather than an exception-for-flow, per the
//! redesign note for "exception-for-flow in intake" (§9).

use std::sync::Arc;
use std::time::Duration;

use event_bus::{Backend, BreakerRegistry, BusError, DeadLetterManager, Event, EventStatus, KvStore, PriorityRouter};
use sqlx::PgPool;
use uuid::Uuid;

use crate::broker_pool::BrokerPool;
use crate::errors::IngestError;
use crate::models::{EstimatedTime, EventStatusResponse, IngestEventRequest, IngestEventResponse};
use crate::validation;

const IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub enum IngestOutcome {
    Accepted { event_id: Uuid, queue_message_id: Option<String>, routed_to: &'static str },
    Duplicate { event_id: Uuid },
}

pub struct IngestService {
    pub db: PgPool,
    pub router: PriorityRouter,
    pub breakers: BreakerRegistry,
    pub kv: Arc<dyn KvStore>,
    pub dlq: Arc<DeadLetterManager>,
    pub pool: BrokerPool,
}

impl IngestService {
    pub async fn ingest(&self, request: IngestEventRequest) -> Result<IngestEventResponse, IngestError> {
        let errors = validation::validate(&request);
        if !errors.is_empty() {
            return Err(IngestError::Validation(errors));
        }

        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = self.kv.get(&idem_key(key)).await? {
                let event_id = Uuid::parse_str(&existing).map_err(|e| IngestError::Internal(e.to_string()))?;
                return Ok(IngestEventResponse {
                    success: true,
                    event_id,
                    message: "duplicate intake, returning cached result".to_string(),
                    queue_message_id: None,
                    cached: Some(true),
                    routed_to: None,
                });
            }
        }

        let event_id = Uuid::now_v7();
        let event = request.into_event(event_id);

        match self.dispatch(event.clone()).await {
            IngestOutcome::Accepted { event_id, queue_message_id, routed_to } => {
                if let Some(key) = &event.idempotency_key {
                    self.kv.set_nx_ex(&idem_key(key), &event_id.to_string(), IDEMPOTENCY_TTL).await?;
                }
                Ok(IngestEventResponse {
                    success: true,
                    event_id,
                    message: "event accepted".to_string(),
                    queue_message_id,
                    cached: None,
                    routed_to: Some(routed_to),
                })
            }
            IngestOutcome::Duplicate { event_id } => Ok(IngestEventResponse {
                success: true,
                event_id,
                message: "duplicate intake, returning cached result".to_string(),
                queue_message_id: None,
                cached: Some(true),
                routed_to: None,
            }),
        }
    }

    /// Steps 4-6 of §4.8: route, check the breaker for failover, push, and
    /// fall back to emergency persistence on total failure.
    async fn dispatch(&self, event: Event) -> IngestOutcome {
        let primary = self.router.route(&event);
        let backend = self.select_backend(primary);

        match self.push(backend, &event).await {
            Ok(queue_message_id) => {
                self.breaker_for(backend).record_success();
                IngestOutcome::Accepted {
                    event_id: event.id,
                    queue_message_id: Some(queue_message_id),
                    routed_to: backend.as_str(),
                }
            }
            Err(e) => {
                self.breaker_for(backend).record_failure();
                tracing::error!(error = %e, backend = backend.as_str(), event_id = %event.id, "push failed, emergency fallback");
                self.emergency_persist(&event, &e.to_string()).await;
                IngestOutcome::Accepted { event_id: event.id, queue_message_id: None, routed_to: backend.as_str() }
            }
        }
    }

    /// If the primary backend's breaker is unavailable, fail over to the
    /// other backend (§4.8 step 5). If there is no fallback capacity either,
    /// still attempt the primary — better to try and fail than to refuse.
    fn select_backend(&self, primary: Backend) -> Backend {
        let primary_breaker = self.breaker_for(primary);
        if primary_breaker.is_available() {
            return primary;
        }
        let fallback = primary.opposite();
        if self.breaker_for(fallback).is_available() {
            tracing::warn!(from = primary.as_str(), to = fallback.as_str(), "circuit open, failing over");
            return fallback;
        }
        primary
    }

    fn breaker_for(&self, backend: Backend) -> event_bus::CircuitBreaker {
        let config = match backend {
            Backend::Broker => event_bus::BreakerConfig::default_queue(),
            Backend::Stream => event_bus::BreakerConfig::default_queue(),
        };
        self.breakers.breaker_for(backend.as_str(), config)
    }

    async fn push(&self, backend: Backend, event: &Event) -> Result<String, BusError> {
        match backend {
            Backend::Broker => self.pool.broker.publish(event).await,
            Backend::Stream => self.pool.stream.publish(event).await,
        }
    }

    /// §4.8 step 6: persist the event row with `status=failed` so it is
    /// durable and recoverable offline even though no back-end accepted it.
    async fn emergency_persist(&self, event: &Event, reason: &str) {
        let result = sqlx::query(
            r#"
            INSERT INTO events (id, user_id, event_type, custom_type, timestamp, priority, payload, metadata, source, status, idempotency_key, last_error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'failed', $10, $11)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(event.id)
        .bind(event.user_id)
        .bind(event.type_name())
        .bind(&event.custom_type)
        .bind(event.timestamp)
        .bind(event.priority as i16)
        .bind(&event.payload)
        .bind(&event.metadata)
        .bind(event.source.as_str())
        .bind(&event.idempotency_key)
        .bind(reason)
        .execute(&self.db)
        .await;

        if let Err(e) = result {
            tracing::error!(error = %e, event_id = %event.id, "emergency persist failed");
            let _ = self
                .dlq
                .send_to_dlq("events.emergency", &serde_json::to_vec(event).unwrap_or_default(), reason, 0)
                .await;
        }
    }

    pub async fn status(&self, event_id: Uuid) -> Result<Option<EventStatusResponse>, IngestError> {
        let row: Option<(String, i32)> = sqlx::query_as("SELECT status, retry_count FROM events WHERE id = $1")
            .bind(event_id)
            .fetch_optional(&self.db)
            .await?;

        let Some((status, retry_count)) = row else {
            return Ok(None);
        };

        let status: EventStatus = match status.as_str() {
            "processing" => EventStatus::Processing,
            "processed" => EventStatus::Processed,
            "failed" => EventStatus::Failed,
            _ => EventStatus::Pending,
        };

        let estimated_time = match status {
            EventStatus::Pending | EventStatus::Processing => Some(EstimatedTime {
                seconds: event_bus::RetryManager::delay(retry_count as u32).as_secs().max(1),
                basis: "retry_backoff_schedule",
            }),
            _ => None,
        };

        Ok(Some(EventStatusResponse { event_id, status, estimated_time }))
    }
}

fn idem_key(key: &str) -> String {
    format!("idempotency:{key}")
}
