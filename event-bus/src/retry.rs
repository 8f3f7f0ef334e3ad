//! Per-event retry bookkeeping: attempt counters with TTL, and an
//! exponential-backoff-with-jitter delay schedule.
//!
//! Attempt counts live in a `KvStore` (TTL 24h, matching the idempotency
//! record's lifetime) rather than in-process atomics, since retries can be
//! observed and driven from any worker process, not just the one that saw
//! the first failure. The delay calculation itself is grounded on
//! `flyingrobots-ninelives`'s `backoff.rs`/`jitter.rs` pair, collapsed into
//! the single `INITIAL * BACKOFF^attempt`, uniform-±20%-jitter schedule the
//! ingestion service uses.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::BusResult;
use crate::kv::KvStore;

pub const MAX_RETRIES: u32 = 5;
pub const INITIAL_DELAY_MS: u64 = 1_000;
pub const BACKOFF_FACTOR: u64 = 2;
pub const MAX_DELAY_MS: u64 = 60_000;
const ATTEMPT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub struct RetryManager {
    kv: Arc<dyn KvStore>,
}

impl RetryManager {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn key(event_id: &str) -> String {
        format!("retry:count:{event_id}")
    }

    pub async fn attempts(&self, event_id: &str) -> BusResult<u32> {
        let raw = self.kv.get(&Self::key(event_id)).await?;
        Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    pub async fn should_retry(&self, event_id: &str) -> BusResult<bool> {
        Ok(self.attempts(event_id).await? < MAX_RETRIES)
    }

    pub async fn increment(&self, event_id: &str) -> BusResult<u32> {
        let count = self.kv.incr_ex(&Self::key(event_id), ATTEMPT_TTL).await?;
        Ok(count as u32)
    }

    pub async fn clear(&self, event_id: &str) -> BusResult<()> {
        self.kv.delete(&Self::key(event_id)).await
    }

    /// Exponential-backoff-with-jitter delay for the given attempt number.
    /// `min(MAX_DELAY, INITIAL * BACKOFF^attempt)`, then ±20% uniform jitter.
    pub fn delay(attempt: u32) -> Duration {
        let base = INITIAL_DELAY_MS.saturating_mul(BACKOFF_FACTOR.saturating_pow(attempt));
        let base = base.min(MAX_DELAY_MS);
        let jitter_range = (base as f64 * 0.2) as i64;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0
        };
        let jittered = (base as i64 + jitter).max(0) as u64;
        Duration::from_millis(jittered)
    }
}

/// Attempt-tracking state threaded alongside a stream entry, distinct from
/// the `RetryManager`'s KV-backed counters: stream redelivery re-appends a
/// new entry id each time, so its own `attempts` field travels in the entry
/// body rather than through the shared KV (§4.5, §9 design note d).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamAttempts(pub u32);

impl StreamAttempts {
    pub const MAX: u32 = 3;

    pub fn exhausted(self) -> bool {
        self.0 >= Self::MAX
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;

    #[test]
    fn delay_follows_exponential_schedule_within_jitter_band() {
        for attempt in 0..8 {
            let base = (INITIAL_DELAY_MS * BACKOFF_FACTOR.pow(attempt)).min(MAX_DELAY_MS) as f64;
            let low = (base * 0.8).floor() as u64;
            let high = (base * 1.2).ceil() as u64;
            for _ in 0..20 {
                let d = RetryManager::delay(attempt).as_millis() as u64;
                assert!(d >= low && d <= high, "attempt {attempt}: {d} not in [{low},{high}]");
            }
        }
    }

    #[test]
    fn delay_caps_at_max_delay() {
        let d = RetryManager::delay(20).as_millis() as u64;
        assert!(d <= (MAX_DELAY_MS as f64 * 1.2) as u64);
    }

    #[tokio::test]
    async fn should_retry_false_after_max_attempts() {
        let manager = RetryManager::new(Arc::new(InMemoryKv::new()));
        for _ in 0..MAX_RETRIES {
            manager.increment("evt-1").await.unwrap();
        }
        assert!(!manager.should_retry("evt-1").await.unwrap());
    }

    #[tokio::test]
    async fn clear_resets_attempts() {
        let manager = RetryManager::new(Arc::new(InMemoryKv::new()));
        manager.increment("evt-1").await.unwrap();
        manager.clear("evt-1").await.unwrap();
        assert_eq!(manager.attempts("evt-1").await.unwrap(), 0);
    }

    #[test]
    fn stream_attempts_exhausts_at_three() {
        let mut a = StreamAttempts::default();
        assert!(!a.exhausted());
        a = a.next().next().next();
        assert_eq!(a.0, 3);
        assert!(a.exhausted());
    }
}
