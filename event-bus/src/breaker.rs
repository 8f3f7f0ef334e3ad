//! Per-resource circuit breaker.
//!
//! Lock-free atomics per resource, grounded on `flyingrobots-ninelives`'s
//! `CircuitBreakerPolicy` (`state: AtomicU8`, CAS-driven transitions). Unlike
//! that crate's `execute()`-wrapper shape, callers here drive the state
//! machine explicitly (`is_available` / `record_success` / `record_failure`)
//! because the breaker gates a routing decision made well before the actual
//! publish call, not a single wrapped future.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl From<u8> for BreakerState {
    fn from(v: u8) -> Self {
        match v {
            STATE_OPEN => BreakerState::Open,
            STATE_HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout_s: i64,
    pub half_open_timeout_s: i64,
}

impl BreakerConfig {
    /// Defaults for application-level resources.
    pub fn default_resource() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            open_timeout_s: 60,
            half_open_timeout_s: 30,
        }
    }

    /// Defaults for queue back-ends, which tolerate more transient noise.
    pub fn default_queue() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 5,
            open_timeout_s: 60,
            half_open_timeout_s: 30,
        }
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

struct Inner {
    state: AtomicU8,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    opened_at: AtomicI64,
    forced: AtomicBool,
}

/// A single named resource's breaker. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    resource: Arc<str>,
    config: BreakerConfig,
    inner: Arc<Inner>,
}

impl CircuitBreaker {
    fn new(resource: Arc<str>, config: BreakerConfig) -> Self {
        Self {
            resource,
            config,
            inner: Arc::new(Inner {
                state: AtomicU8::new(STATE_CLOSED),
                failure_count: AtomicU32::new(0),
                success_count: AtomicU32::new(0),
                opened_at: AtomicI64::new(0),
                forced: AtomicBool::new(false),
            }),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn state(&self) -> BreakerState {
        self.inner.state.load(Ordering::Acquire).into()
    }

    /// True if a call may proceed. Transitions OPEN -> HALF_OPEN when the
    /// cool-down has elapsed. The race against a concurrent `record_failure`
    /// crossing the same boundary is benign: at most one extra call slips
    /// through before the next observation corrects the state.
    pub fn is_available(&self) -> bool {
        match self.state() {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let opened_at = self.inner.opened_at.load(Ordering::Acquire);
                if now_unix() - opened_at > self.config.open_timeout_s {
                    let _ = self.inner.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    self.inner.success_count.store(0, Ordering::Release);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        match self.state() {
            BreakerState::Closed => {
                self.inner.failure_count.store(0, Ordering::Release);
            }
            BreakerState::HalfOpen => {
                let successes = self.inner.success_count.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold {
                    self.inner.state.store(STATE_CLOSED, Ordering::Release);
                    self.inner.failure_count.store(0, Ordering::Release);
                    self.inner.success_count.store(0, Ordering::Release);
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        match self.state() {
            BreakerState::Closed => {
                let failures = self.inner.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.trip();
                }
            }
            BreakerState::HalfOpen => {
                self.trip();
            }
            BreakerState::Open => {}
        }
    }

    fn trip(&self) {
        self.inner.state.store(STATE_OPEN, Ordering::Release);
        self.inner.opened_at.store(now_unix(), Ordering::Release);
        self.inner.success_count.store(0, Ordering::Release);
        tracing::warn!(resource = %self.resource, "circuit breaker opened");
    }

    pub fn force_open(&self, reason: &str) {
        self.inner.forced.store(true, Ordering::Release);
        self.inner.state.store(STATE_OPEN, Ordering::Release);
        self.inner.opened_at.store(now_unix(), Ordering::Release);
        tracing::warn!(resource = %self.resource, reason, "circuit breaker forced open");
    }

    pub fn force_close(&self, reason: &str) {
        self.inner.forced.store(false, Ordering::Release);
        self.inner.state.store(STATE_CLOSED, Ordering::Release);
        self.inner.failure_count.store(0, Ordering::Release);
        self.inner.success_count.store(0, Ordering::Release);
        tracing::info!(resource = %self.resource, reason, "circuit breaker forced closed");
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            resource: self.resource.to_string(),
            state: self.state(),
            failure_count: self.inner.failure_count.load(Ordering::Acquire),
            success_count: self.inner.success_count.load(Ordering::Acquire),
            opened_at: self.inner.opened_at.load(Ordering::Acquire),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerSnapshot {
    pub resource: String,
    #[serde(with = "state_serde")]
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub opened_at: i64,
}

mod state_serde {
    use super::BreakerState;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(state: &BreakerState, s: S) -> Result<S::Ok, S::Error> {
        let name = match state {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        s.serialize_str(name)
    }
}

/// Registry of breakers keyed by resource name, so `breaker_for("rabbitmq")`
/// returns the same breaker instance across the process.
#[derive(Clone, Default)]
pub struct BreakerRegistry {
    breakers: Arc<DashMap<String, CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn breaker_for(&self, resource: &str, config: BreakerConfig) -> CircuitBreaker {
        self.breakers
            .entry(resource.to_string())
            .or_insert_with(|| CircuitBreaker::new(Arc::from(resource), config))
            .clone()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.iter().map(|e| e.value().snapshot()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout_s: 0,
            half_open_timeout_s: 0,
        }
    }

    #[test]
    fn trips_after_failure_threshold() {
        let breaker = CircuitBreaker::new(Arc::from("rabbitmq"), fast_config());
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn half_open_after_timeout_then_closes_on_success_threshold() {
        let breaker = CircuitBreaker::new(Arc::from("rabbitmq"), fast_config());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        sleep(Duration::from_millis(5));
        assert!(breaker.is_available());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(Arc::from("redis"), fast_config());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();
        sleep(Duration::from_millis(5));
        assert!(breaker.is_available());
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn registry_returns_same_breaker_for_same_resource() {
        let registry = BreakerRegistry::new();
        let a = registry.breaker_for("rabbitmq", fast_config());
        a.record_failure();
        let b = registry.breaker_for("rabbitmq", fast_config());
        assert_eq!(b.snapshot().failure_count, 1);
    }

    #[test]
    fn force_open_and_close_override_counters() {
        let breaker = CircuitBreaker::new(Arc::from("rabbitmq"), BreakerConfig::default_resource());
        breaker.force_open("operator drill");
        assert_eq!(breaker.state(), BreakerState::Open);
        breaker.force_close("drill complete");
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
