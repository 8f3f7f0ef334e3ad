//! Priority router (C6): classifies an event as high- or normal-priority and
//! names the back-end it belongs on. The routing rule itself has no teacher
//! precedent — the teacher's modules each own a single fixed subject rather
//! than choosing between back-ends per event — but the "emit a counter and a
//! duration histogram on every decision" habit is the same one `src/metrics.rs`
//! and the per-module consumers apply to every publish/consume call.

use std::sync::Arc;
use std::time::Instant;

use crate::event::Event;
use crate::metrics::MetricsSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Broker,
    Stream,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Broker => "rabbitmq",
            Backend::Stream => "redis",
        }
    }

    pub fn opposite(self) -> Backend {
        match self {
            Backend::Broker => Backend::Stream,
            Backend::Stream => Backend::Broker,
        }
    }
}

#[derive(Clone)]
pub struct PriorityRouter {
    metrics: Arc<MetricsSink>,
}

impl PriorityRouter {
    pub fn new(metrics: Arc<MetricsSink>) -> Self {
        Self { metrics }
    }

    /// `route` per §4.6: high-priority iff the event's type (or custom tag)
    /// is in the high-priority set, `priority >= 8`, or it's a purchase with
    /// `payload.amount >= 100`. The 100 threshold is the one the spec pins;
    /// do not substitute the 1000 variant seen elsewhere in the corpus.
    pub fn route(&self, event: &Event) -> Backend {
        let started = Instant::now();
        let backend = if event.is_high_priority() {
            Backend::Broker
        } else {
            Backend::Stream
        };

        self.metrics.incr_counter(
            "events_routed_total",
            &[
                ("priority", if backend == Backend::Broker { "high" } else { "normal" }),
                ("event_type", event.type_name()),
            ],
        );
        self.metrics.observe_duration(
            "routing_duration_seconds",
            &[],
            started.elapsed().as_secs_f64(),
        );

        backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventSource, EventStatus, EventType};
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn base_event(event_type: EventType, priority: u8, payload: serde_json::Value) -> Event {
        Event {
            id: Uuid::now_v7(),
            user_id: Uuid::now_v7(),
            event_type,
            custom_type: None,
            timestamp: Utc::now(),
            payload,
            metadata: None,
            priority,
            idempotency_key: None,
            source: EventSource::Api,
            queue_message_id: None,
            status: EventStatus::Pending,
            retry_count: 0,
            last_error: None,
            processed_at: None,
        }
    }

    #[test]
    fn purchase_at_boundary_amount_is_high_priority() {
        let router = PriorityRouter::new(Arc::new(MetricsSink::new("test")));
        let event = base_event(EventType::Purchase, 1, json!({"amount": 100, "currency": "USD"}));
        assert_eq!(router.route(&event), Backend::Broker);
    }

    #[test]
    fn purchase_below_boundary_with_low_priority_is_normal() {
        let router = PriorityRouter::new(Arc::new(MetricsSink::new("test")));
        let event = base_event(EventType::Purchase, 1, json!({"amount": 99, "currency": "USD"}));
        assert_eq!(router.route(&event), Backend::Stream);
    }

    #[test]
    fn explicit_priority_overrides_type() {
        let router = PriorityRouter::new(Arc::new(MetricsSink::new("test")));
        let event = base_event(EventType::Click, 8, json!({}));
        assert_eq!(router.route(&event), Backend::Broker);
    }

    #[test]
    fn custom_tagged_refund_is_high_priority() {
        let router = PriorityRouter::new(Arc::new(MetricsSink::new("test")));
        let mut event = base_event(EventType::Custom, 1, json!({}));
        event.custom_type = Some("refund".to_string());
        assert_eq!(router.route(&event), Backend::Broker);
    }

    #[test]
    fn view_event_is_normal() {
        let router = PriorityRouter::new(Arc::new(MetricsSink::new("test")));
        let event = base_event(EventType::View, 1, json!({}));
        assert_eq!(router.route(&event), Backend::Stream);
    }
}
