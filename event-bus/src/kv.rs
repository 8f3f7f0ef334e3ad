//! Generic key-value store abstraction used for retry counters, idempotency
//! markers, and the DLQ backup list — anything that needs cross-process TTL
//! semantics rather than the in-process atomics the breaker uses.
//!
//! Shaped after the teacher's `EventBus` trait: one `#[async_trait]` trait,
//! one production implementation (`RedisKv`) and one in-memory implementation
//! (`InMemoryKv`) used in tests and for the single-process deployment mode,
//! exactly the way `NatsBus`/`InMemoryBus` pair up in `platform/event-bus`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::error::{BusError, BusResult};

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> BusResult<Option<String>>;

    /// Set `key` to `value` only if absent, with a TTL. Returns `true` if the
    /// set happened (the SETNX-style semantics idempotency checks rely on).
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> BusResult<bool>;

    async fn incr(&self, key: &str) -> BusResult<i64>;

    /// Increment `key`, arming a TTL on it if (and only if) this call is the
    /// one that creates it — a bare `INCR` on an absent key creates it with
    /// no expiry and does not inherit one later, so callers that need a
    /// bounded-lifetime counter (retry attempt counts, §4.3) must use this
    /// instead of `incr`.
    async fn incr_ex(&self, key: &str, ttl: Duration) -> BusResult<i64>;

    async fn delete(&self, key: &str) -> BusResult<()>;

    async fn list_push(&self, key: &str, value: &str) -> BusResult<()>;

    async fn list_pop_front(&self, key: &str) -> BusResult<Option<String>>;

    async fn list_len(&self, key: &str) -> BusResult<i64>;

    /// Trim a list to its most recent `max_len` entries (oldest discarded),
    /// used by the DLQ backup list cap.
    async fn list_trim(&self, key: &str, max_len: i64) -> BusResult<()>;
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Store {
    scalars: HashMap<String, Entry>,
    lists: HashMap<String, Vec<String>>,
}

/// In-process store for tests and single-node deployments. Expiry is
/// evaluated lazily on read, matching `InMemoryBus`'s "good enough for a
/// single process" posture.
pub struct InMemoryKv {
    inner: Mutex<Store>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Store::default()),
        }
    }

    fn is_live(entry: &Entry) -> bool {
        match entry.expires_at {
            Some(t) => Instant::now() < t,
            None => true,
        }
    }
}

impl Default for InMemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> BusResult<Option<String>> {
        let mut store = self.inner.lock().expect("kv lock poisoned");
        if let Some(entry) = store.scalars.get(key) {
            if Self::is_live(entry) {
                return Ok(Some(entry.value.clone()));
            }
            store.scalars.remove(key);
        }
        Ok(None)
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> BusResult<bool> {
        let mut store = self.inner.lock().expect("kv lock poisoned");
        if let Some(entry) = store.scalars.get(key) {
            if Self::is_live(entry) {
                return Ok(false);
            }
        }
        store.scalars.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn incr(&self, key: &str) -> BusResult<i64> {
        let mut store = self.inner.lock().expect("kv lock poisoned");
        let current = store
            .scalars
            .get(key)
            .filter(|e| Self::is_live(e))
            .and_then(|e| e.value.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        store.scalars.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: None,
            },
        );
        Ok(next)
    }

    async fn incr_ex(&self, key: &str, ttl: Duration) -> BusResult<i64> {
        let mut store = self.inner.lock().expect("kv lock poisoned");
        let (current, keep_expiry) = match store.scalars.get(key) {
            Some(entry) if Self::is_live(entry) => (entry.value.parse::<i64>().unwrap_or(0), entry.expires_at),
            _ => (0, None),
        };
        let next = current + 1;
        let expires_at = keep_expiry.or_else(|| Some(Instant::now() + ttl));
        store.scalars.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn delete(&self, key: &str) -> BusResult<()> {
        let mut store = self.inner.lock().expect("kv lock poisoned");
        store.scalars.remove(key);
        store.lists.remove(key);
        Ok(())
    }

    async fn list_push(&self, key: &str, value: &str) -> BusResult<()> {
        let mut store = self.inner.lock().expect("kv lock poisoned");
        store.lists.entry(key.to_string()).or_default().push(value.to_string());
        Ok(())
    }

    async fn list_pop_front(&self, key: &str) -> BusResult<Option<String>> {
        let mut store = self.inner.lock().expect("kv lock poisoned");
        match store.lists.get_mut(key) {
            Some(list) if !list.is_empty() => Ok(Some(list.remove(0))),
            _ => Ok(None),
        }
    }

    async fn list_len(&self, key: &str) -> BusResult<i64> {
        let store = self.inner.lock().expect("kv lock poisoned");
        Ok(store.lists.get(key).map(|l| l.len() as i64).unwrap_or(0))
    }

    async fn list_trim(&self, key: &str, max_len: i64) -> BusResult<()> {
        let mut store = self.inner.lock().expect("kv lock poisoned");
        if let Some(list) = store.lists.get_mut(key) {
            let max_len = max_len.max(0) as usize;
            if list.len() > max_len {
                let drop = list.len() - max_len;
                list.drain(0..drop);
            }
        }
        Ok(())
    }
}

/// Redis-backed store for production. One multiplexed connection manager
/// shared across callers, the way `NatsBus` holds a single shared
/// `async_nats::Client`.
pub struct RedisKv {
    conn: redis::aio::ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> BusResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| BusError::Kv(format!("invalid redis url: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| BusError::Kv(format!("redis connect failed: {e}")))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> BusResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key)
            .await
            .map_err(|e| BusError::Kv(format!("GET {key}: {e}")))
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> BusResult<bool> {
        let mut conn = self.conn.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::Kv(format!("SET NX EX {key}: {e}")))?;
        Ok(result.is_some())
    }

    async fn incr(&self, key: &str) -> BusResult<i64> {
        let mut conn = self.conn.clone();
        conn.incr(key, 1)
            .await
            .map_err(|e| BusError::Kv(format!("INCR {key}: {e}")))
    }

    async fn incr_ex(&self, key: &str, ttl: Duration) -> BusResult<i64> {
        let mut conn = self.conn.clone();
        let (count, _): (i64, i64) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::Kv(format!("INCR+EXPIRE NX {key}: {e}")))?;
        Ok(count)
    }

    async fn delete(&self, key: &str) -> BusResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(key)
            .await
            .map_err(|e| BusError::Kv(format!("DEL {key}: {e}")))?;
        Ok(())
    }

    async fn list_push(&self, key: &str, value: &str) -> BusResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .rpush(key, value)
            .await
            .map_err(|e| BusError::Kv(format!("RPUSH {key}: {e}")))?;
        Ok(())
    }

    async fn list_pop_front(&self, key: &str) -> BusResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.lpop(key, None)
            .await
            .map_err(|e| BusError::Kv(format!("LPOP {key}: {e}")))
    }

    async fn list_len(&self, key: &str) -> BusResult<i64> {
        let mut conn = self.conn.clone();
        conn.llen(key)
            .await
            .map_err(|e| BusError::Kv(format!("LLEN {key}: {e}")))
    }

    async fn list_trim(&self, key: &str, max_len: i64) -> BusResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .ltrim(key, -max_len as isize, -1)
            .await
            .map_err(|e| BusError::Kv(format!("LTRIM {key}: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_ex_is_idempotent_until_expiry() {
        let kv = InMemoryKv::new();
        assert!(kv.set_nx_ex("k", "v1", Duration::from_secs(60)).await.unwrap());
        assert!(!kv.set_nx_ex("k", "v2", Duration::from_secs(60)).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap(), Some("v1".to_string()));
    }

    #[tokio::test]
    async fn list_trim_keeps_most_recent() {
        let kv = InMemoryKv::new();
        for i in 0..5 {
            kv.list_push("backup", &i.to_string()).await.unwrap();
        }
        kv.list_trim("backup", 3).await.unwrap();
        assert_eq!(kv.list_len("backup").await.unwrap(), 3);
        assert_eq!(kv.list_pop_front("backup").await.unwrap(), Some("2".to_string()));
    }

    #[tokio::test]
    async fn incr_starts_at_one() {
        let kv = InMemoryKv::new();
        assert_eq!(kv.incr("counter").await.unwrap(), 1);
        assert_eq!(kv.incr("counter").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn incr_ex_arms_ttl_only_on_creation() {
        let kv = InMemoryKv::new();
        assert_eq!(kv.incr_ex("counter", Duration::from_secs(60)).await.unwrap(), 1);
        {
            let store = kv.inner.lock().unwrap();
            assert!(store.scalars.get("counter").unwrap().expires_at.is_some());
        }
        assert_eq!(kv.incr_ex("counter", Duration::from_secs(120)).await.unwrap(), 2);
    }
}
