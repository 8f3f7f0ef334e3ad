//! Event processor (C9): deserialize, persist under a transaction, fan out
//! to handlers, mark processed, and record idempotency — the same shape
//! regardless of which back-end the delivery came from.

use std::sync::Arc;
use std::time::{Duration, Instant};

use event_bus::{Event, EventSource, KvStore, MetricsSink};
use sqlx::PgPool;

use crate::errors::ProcessError;
use crate::handlers::HandlerRegistry;

const IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub struct EventProcessor {
    pub db: PgPool,
    pub kv: Arc<dyn KvStore>,
    pub handlers: HandlerRegistry,
    pub metrics: Arc<MetricsSink>,
}

pub enum ProcessOutcome {
    Processed,
    Duplicate,
}

impl EventProcessor {
    /// §4.9 process_event.
    pub async fn process(&self, event: &Event, source: EventSource) -> Result<ProcessOutcome, ProcessError> {
        let started = Instant::now();

        if let Some(key) = &event.idempotency_key {
            // The KV record is the fast path; once its TTL has lapsed it no
            // longer answers "was this handled", so `processed_events` is
            // the durable backstop consulted only on a KV miss.
            let already_processed = if self.kv.get(&idem_key(key)).await?.is_some() {
                true
            } else {
                self.is_event_processed(key).await?
            };
            if already_processed {
                self.metrics.incr_counter(
                    "event_processed_total",
                    &[("type", event.type_name()), ("status", "duplicate"), ("source", source.as_str())],
                );
                return Ok(ProcessOutcome::Duplicate);
            }
        }

        let mut tx = self.db.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO events (id, user_id, event_type, custom_type, timestamp, priority, payload, metadata, status, source, idempotency_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'processing', $9, $10)
            ON CONFLICT (id) DO UPDATE SET status = 'processing'
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
        .bind(source.as_str())
        .bind(&event.idempotency_key)
        .execute(&mut *tx)
        .await?;

        // Best-effort fan-out: a handler failure is logged and counted but
        // never aborts the transaction — default policy is log and continue
        // (§4.9 step 2b).
        for handler in self.handlers.handlers_for(event.type_name()) {
            if let Err(e) = handler.handle(event).await {
                tracing::error!(handler = handler.name(), event_id = %event.id, error = %e, "handler error");
                self.metrics.incr_counter("handler_errors_total", &[("handler", handler.name())]);
            }
        }

        sqlx::query("UPDATE events SET status = 'processed', processed_at = now() WHERE id = $1")
            .bind(event.id)
            .execute(&mut *tx)
            .await?;

        if let Some(key) = &event.idempotency_key {
            sqlx::query(
                r#"
                INSERT INTO processed_events (idempotency_key, event_id)
                VALUES ($1, $2)
                ON CONFLICT (idempotency_key) DO NOTHING
                "#,
            )
            .bind(key)
            .bind(event.id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        if let Some(key) = &event.idempotency_key {
            self.kv.set_nx_ex(&idem_key(key), &event.id.to_string(), IDEMPOTENCY_TTL).await?;
        }

        self.metrics.observe_duration(
            "event_processing_duration_seconds",
            &[("event_type", event.type_name()), ("priority", priority_label(event.priority)), ("source", source.as_str())],
            started.elapsed().as_secs_f64(),
        );
        self.metrics.incr_counter(
            "event_processed_total",
            &[("type", event.type_name()), ("status", "processed"), ("source", source.as_str())],
        );

        Ok(ProcessOutcome::Processed)
    }

    /// Durable idempotency check against `processed_events`, consulted only
    /// once the faster KV record has expired.
    async fn is_event_processed(&self, idempotency_key: &str) -> Result<bool, ProcessError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM processed_events WHERE idempotency_key = $1")
            .bind(idempotency_key)
            .fetch_one(&self.db)
            .await?;
        Ok(row.0 > 0)
    }
}

fn priority_label(priority: u8) -> &'static str {
    if priority >= 8 {
        "high"
    } else {
        "normal"
    }
}

fn idem_key(key: &str) -> String {
    format!("idempotency:{key}")
}
