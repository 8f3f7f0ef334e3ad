//! Dead-letter manager (C7): cascading failure sink — broker DLX, then a KV
//! backup list, then a file log — plus the retry-delay publish path and
//! restore-from-backup.
//!
//! Owns its own connection to the broker rather than sharing a consumer's
//! channel, per the ownership note in the design: a cancelled consumer
//! channel must not take DLQ writes down with it (§9).

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use lapin::options::BasicPublishOptions;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel};
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::broker::{BrokerAdapter, EXCHANGE_DLX, ROUTING_DEAD};
use crate::error::{BusError, BusResult};
use crate::kv::KvStore;
use crate::metrics::MetricsSink;

const BACKUP_LIST_KEY: &str = "events:dlq:backup";
const BACKUP_LIST_MAX: i64 = 10_000;
const RESTORE_BATCH: usize = 100;

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
struct DlqBackupRecord {
    original_queue: String,
    body: String,
    error: String,
    retry_count: u32,
    failed_at: chrono::DateTime<Utc>,
}

pub struct DeadLetterManager {
    channel: Channel,
    kv: Arc<dyn KvStore>,
    metrics: Arc<MetricsSink>,
    backup_file: PathBuf,
    file_lock: Mutex<()>,
}

impl DeadLetterManager {
    /// Opens its own channel on the broker connection owned by `broker`, so
    /// DLQ publishes survive a consumer channel cancellation.
    pub fn new(broker: &BrokerAdapter, kv: Arc<dyn KvStore>, metrics: Arc<MetricsSink>, backup_file: impl Into<PathBuf>) -> Self {
        Self {
            channel: broker.channel(),
            kv,
            metrics,
            backup_file: backup_file.into(),
            file_lock: Mutex::new(()),
        }
    }

    /// §4.7 send_to_dlq: publish to the DLX with routing key "dead"; on
    /// broker failure, fall back to the KV backup list, then a backup file.
    pub async fn send_to_dlq(
        &self,
        original_queue: &str,
        body: &[u8],
        error: &str,
        retry_count: u32,
    ) -> BusResult<()> {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from("x-original-queue"),
            AMQPValue::LongString(original_queue.into()),
        );
        headers.insert(ShortString::from("x-error"), AMQPValue::LongString(error.into()));
        headers.insert(
            ShortString::from("x-retry-count"),
            AMQPValue::LongInt(retry_count as i32),
        );

        let properties = BasicProperties::default().with_delivery_mode(2).with_headers(headers);

        let published = self
            .channel
            .basic_publish(EXCHANGE_DLX, ROUTING_DEAD, BasicPublishOptions::default(), body, properties)
            .await;

        match published {
            Ok(confirm) => match confirm.await {
                Ok(_) => {
                    self.metrics.incr_counter("dlq_messages_total", &[("sink", "broker")]);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "dlq broker publish confirm failed, falling back to kv");
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "dlq broker publish failed, falling back to kv");
            }
        }

        self.send_to_kv_backup(original_queue, body, error, retry_count).await
    }

    async fn send_to_kv_backup(
        &self,
        original_queue: &str,
        body: &[u8],
        error: &str,
        retry_count: u32,
    ) -> BusResult<()> {
        let record = DlqBackupRecord {
            original_queue: original_queue.to_string(),
            body: String::from_utf8_lossy(body).to_string(),
            error: error.to_string(),
            retry_count,
            failed_at: Utc::now(),
        };
        let json = serde_json::to_string(&record).map_err(|e| BusError::Decode(e.to_string()))?;

        match self.kv.list_push(BACKUP_LIST_KEY, &json).await {
            Ok(()) => {
                let _ = self.kv.list_trim(BACKUP_LIST_KEY, BACKUP_LIST_MAX).await;
                self.metrics.incr_counter("dlq_messages_total", &[("sink", "kv_backup")]);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "dlq kv backup failed, falling back to file log");
                self.send_to_file_backup(&json).await
            }
        }
    }

    async fn send_to_file_backup(&self, line: &str) -> BusResult<()> {
        let _guard = self.file_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.backup_file)
            .await
            .map_err(|e| BusError::DlqPublish(format!("open {}: {e}", self.backup_file.display())))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| BusError::DlqPublish(format!("write {}: {e}", self.backup_file.display())))?;
        file.write_all(b"\n")
            .await
            .map_err(|e| BusError::DlqPublish(format!("write {}: {e}", self.backup_file.display())))?;
        self.metrics.incr_counter("dlq_messages_total", &[("sink", "file")]);
        Ok(())
    }

    /// §4.7 send_to_retry_queue: publish with TTL = C3's computed delay; the
    /// retry queue dead-letters back onto the originating queue once the TTL
    /// expires, which is the delay mechanism this service relies on.
    pub async fn send_to_retry_queue(
        &self,
        original_queue: &str,
        body: &[u8],
        retry_count: u32,
        delay_ms: u64,
    ) -> BusResult<()> {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from("x-original-queue"),
            AMQPValue::LongString(original_queue.into()),
        );
        headers.insert(
            ShortString::from("x-retry-count"),
            AMQPValue::LongInt(retry_count as i32),
        );

        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_expiration(delay_ms.to_string().into())
            .with_headers(headers);

        self.channel
            .basic_publish(
                "events.retry",
                original_queue,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(|e| BusError::DlqPublish(format!("retry publish: {e}")))?
            .await
            .map_err(|e| BusError::DlqPublish(format!("retry publish confirm: {e}")))?;

        self.metrics.incr_counter("retry_scheduled_total", &[("queue", original_queue)]);
        Ok(())
    }

    /// §4.7 restore_from_backup: pop up to 100 messages from the KV list and
    /// republish them to the broker DLQ.
    pub async fn restore_from_backup(&self) -> BusResult<usize> {
        let mut restored = 0;
        for _ in 0..RESTORE_BATCH {
            let Some(raw) = self.kv.list_pop_front(BACKUP_LIST_KEY).await? else {
                break;
            };
            let record: DlqBackupRecord = match serde_json::from_str(&raw) {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(error = %e, "dropping unparseable dlq backup record");
                    continue;
                }
            };
            self.send_to_dlq(&record.original_queue, record.body.as_bytes(), &record.error, record.retry_count)
                .await?;
            restored += 1;
        }
        Ok(restored)
    }

    pub async fn stats(&self) -> BusResult<DlqStats> {
        Ok(DlqStats {
            kv_backup_count: self.kv.list_len(BACKUP_LIST_KEY).await?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DlqStats {
    pub kv_backup_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;

    // `DeadLetterManager` needs a live broker channel to construct, which
    // these unit tests don't stand up; the broker-publish and file-fallback
    // paths are covered by the `tests/` integration suite against the
    // in-memory adapter pair instead. These cases pin the backup record
    // encoding the KV and restore paths both depend on.

    #[tokio::test]
    async fn backup_record_round_trips_through_json() {
        let record = DlqBackupRecord {
            original_queue: "events.normal".to_string(),
            body: "{\"n\":1}".to_string(),
            error: "boom".to_string(),
            retry_count: 1,
            failed_at: Utc::now(),
        };
        let json = serde_json::to_string(&record).unwrap();
        let decoded: DlqBackupRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.original_queue, "events.normal");
        assert_eq!(decoded.retry_count, 1);
    }

    #[tokio::test]
    async fn kv_backup_list_accumulates_and_trims() {
        let kv = Arc::new(InMemoryKv::new());
        for i in 0..5 {
            let record = DlqBackupRecord {
                original_queue: "events.normal".to_string(),
                body: format!("{{\"n\":{i}}}"),
                error: "boom".to_string(),
                retry_count: 1,
                failed_at: Utc::now(),
            };
            kv.list_push(BACKUP_LIST_KEY, &serde_json::to_string(&record).unwrap())
                .await
                .unwrap();
        }
        kv.list_trim(BACKUP_LIST_KEY, BACKUP_LIST_MAX).await.unwrap();
        assert_eq!(kv.list_len(BACKUP_LIST_KEY).await.unwrap(), 5);
    }
}
