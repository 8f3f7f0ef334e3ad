//! Error taxonomy for the dual-backend event bus.
//!
//! Variant shape (a flat `thiserror` enum of `Xyz(String)` cases, one per
//! failure mode, no nested causes) follows the teacher's own
//! `platform/event-bus::BusError` — same idea, widened from one
//! publish/subscribe pair to the two back-ends and the breaker/retry/DLQ
//! pieces this service adds around them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("broker publish failed: {0}")]
    BrokerPublish(String),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("stream publish failed: {0}")]
    StreamPublish(String),

    #[error("stream unavailable: {0}")]
    StreamUnavailable(String),

    #[error("message decode error: {0}")]
    Decode(String),

    #[error("dead-letter publish failed: {0}")]
    DlqPublish(String),

    #[error("kv backend error: {0}")]
    Kv(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type BusResult<T> = Result<T, BusError>;
