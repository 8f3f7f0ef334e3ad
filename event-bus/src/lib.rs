//! Dual-backend event bus: a durable priority broker plus a consumer-group
//! stream, fronted by a priority router, gated by per-resource circuit
//! breakers, and backstopped by a cascading dead-letter manager.
//!
//! Mirrors the shape of the teacher's `platform/event-bus` crate — a small
//! set of focused modules, a trait per back-end with a production and an
//! in-memory implementation, and a thin re-export surface in this file —
//! generalized from a single NATS subject space to two heterogeneous
//! back-ends with their own topology and failure modes.

pub mod breaker;
pub mod broker;
pub mod dlq;
pub mod error;
pub mod event;
pub mod kv;
pub mod metrics;
pub mod retry;
pub mod router;
pub mod stream;

pub use breaker::{BreakerConfig, BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use broker::{BrokerAdapter, BrokerDelivery};
pub use dlq::{DeadLetterManager, DlqStats};
pub use error::{BusError, BusResult};
pub use event::{Event, EventSource, EventStatus, EventType, StreamDlqEntry};
pub use kv::{InMemoryKv, KvStore, RedisKv};
pub use metrics::MetricsSink;
pub use retry::{RetryManager, StreamAttempts, MAX_RETRIES};
pub use router::{Backend, PriorityRouter};
pub use stream::{StreamAdapter, StreamEntry};
