//! Worker supervisor (C10): a long-running drain loop that exits cleanly on
//! shutdown signal, memory-cap breach, uptime-cap breach, or a restart-flag
//! file, and always leaves exit code 0 — a process supervisor above this
//! layer is responsible for relaunching it (§4.10).

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use event_bus::{BrokerAdapter, DeadLetterManager, MetricsSink, RetryManager, StreamAdapter, StreamAttempts};
use sysinfo::{Pid, System};
use tokio::signal::unix::{signal, SignalKind};

use crate::errors::SupervisorError;
use crate::processor::{EventProcessor, ProcessOutcome};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub batch_size: usize,
    pub poll_sleep_s: u64,
    pub memory_cap_mb: u64,
    pub max_uptime_s: u64,
    pub restart_flag_path: PathBuf,
}

enum ExitReason {
    Shutdown,
    MemoryCap,
    UptimeCap,
    RestartFlag,
}

impl ExitReason {
    fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Shutdown => "shutdown_signal",
            ExitReason::MemoryCap => "memory_cap",
            ExitReason::UptimeCap => "uptime_cap",
            ExitReason::RestartFlag => "restart_flag",
        }
    }
}

struct DrainLoop {
    config: WorkerConfig,
    started_at: Instant,
    processed: AtomicU64,
    empty_batches: AtomicU64,
    sys: tokio::sync::Mutex<System>,
}

impl DrainLoop {
    fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            started_at: Instant::now(),
            processed: AtomicU64::new(0),
            empty_batches: AtomicU64::new(0),
            sys: tokio::sync::Mutex::new(System::new()),
        }
    }

    async fn should_exit(&self) -> Option<ExitReason> {
        if self.started_at.elapsed() >= Duration::from_secs(self.config.max_uptime_s) {
            return Some(ExitReason::UptimeCap);
        }
        if tokio::fs::metadata(&self.config.restart_flag_path).await.is_ok() {
            let _ = tokio::fs::remove_file(&self.config.restart_flag_path).await;
            return Some(ExitReason::RestartFlag);
        }
        if self.memory_usage_mb().await >= (self.config.memory_cap_mb * 85 / 100) {
            return Some(ExitReason::MemoryCap);
        }
        None
    }

    async fn memory_usage_mb(&self) -> u64 {
        let mut sys = self.sys.lock().await;
        let pid = Pid::from_u32(std::process::id());
        sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
        sys.process(pid).map(|p| p.memory() / (1024 * 1024)).unwrap_or(0)
    }

    async fn record_batch(&self, count: usize) -> Duration {
        if count == 0 {
            let empties = self.empty_batches.fetch_add(1, Ordering::Relaxed) + 1;
            let doubled = self.config.poll_sleep_s.saturating_mul(1u64 << empties.min(4));
            return Duration::from_secs(doubled.min(10));
        }
        self.empty_batches.store(0, Ordering::Relaxed);
        let total = self.processed.fetch_add(count as u64, Ordering::Relaxed) + count as u64;
        if total % 1_000 < count as u64 {
            let elapsed = self.started_at.elapsed().as_secs_f64().max(1.0);
            tracing::info!(total_processed = total, rate_per_s = total as f64 / elapsed, "worker progress");
        }
        Duration::from_secs(self.config.poll_sleep_s)
    }
}

async fn wait_for_shutdown_signal() {
    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut hup = signal(SignalKind::hangup()).expect("install SIGHUP handler");

    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
        _ = hup.recv() => {}
    }
}

pub async fn run_broker_worker(
    broker: Arc<BrokerAdapter>,
    processor: Arc<EventProcessor>,
    retry: Arc<RetryManager>,
    dlq: Arc<DeadLetterManager>,
    metrics: Arc<MetricsSink>,
    queue: &str,
    config: WorkerConfig,
) -> Result<(), SupervisorError> {
    let drain = DrainLoop::new(config);
    let mut shutdown = Box::pin(wait_for_shutdown_signal());

    let exit_reason = loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break ExitReason::Shutdown,
            delivery = broker.consume_one(queue, Duration::from_secs(1)) => {
                let delivery = delivery?;
                let processed_count = match delivery {
                    None => 0,
                    Some(delivery) => {
                        handle_broker_delivery(&delivery, &processor, &retry, &dlq, &metrics, queue).await;
                        1
                    }
                };
                let sleep_for = drain.record_batch(processed_count).await;
                if processed_count == 0 {
                    tokio::time::sleep(sleep_for).await;
                }
                if let Some(reason) = drain.should_exit().await {
                    break reason;
                }
            }
        }
    };

    tracing::info!(reason = exit_reason.as_str(), "broker worker exiting");
    broker.shutdown().await?;
    Ok(())
}

async fn handle_broker_delivery(
    delivery: &event_bus::BrokerDelivery,
    processor: &EventProcessor,
    retry: &RetryManager,
    dlq: &DeadLetterManager,
    metrics: &MetricsSink,
    queue: &str,
) {
    if delivery.retry_count > 0 {
        match retry.should_retry(&delivery.event.id.to_string()).await {
            Ok(true) => {}
            Ok(false) => {
                let _ = dlq
                    .send_to_dlq(queue, &delivery.raw_body, "max retries exceeded", delivery.retry_count)
                    .await;
                let _ = delivery.ack().await;
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "retry manager unavailable, treating as transient");
            }
        }
    }

    match processor.process(&delivery.event, event_bus::EventSource::Broker).await {
        Ok(ProcessOutcome::Processed) | Ok(ProcessOutcome::Duplicate) => {
            if delivery.retry_count > 0 {
                let _ = retry.clear(&delivery.event.id.to_string()).await;
            }
            let _ = delivery.ack().await;
            metrics.incr_counter("event_acked_total", &[("queue", queue)]);
        }
        Err(e) => {
            tracing::error!(error = %e, event_id = %delivery.event.id, "processing failed");
            match retry.should_retry(&delivery.event.id.to_string()).await {
                Ok(true) => {
                    let attempt = retry.increment(&delivery.event.id.to_string()).await.unwrap_or(1);
                    let delay = RetryManager::delay(attempt);
                    let _ = dlq
                        .send_to_retry_queue(queue, &delivery.raw_body, attempt, delay.as_millis() as u64)
                        .await;
                }
                _ => {
                    let _ = dlq.send_to_dlq(queue, &delivery.raw_body, &e.to_string(), delivery.retry_count).await;
                }
            }
            let _ = delivery.ack().await;
        }
    }
}

pub async fn run_stream_worker(
    stream: Arc<StreamAdapter>,
    processor: Arc<EventProcessor>,
    dlq: Arc<DeadLetterManager>,
    metrics: Arc<MetricsSink>,
    stream_key: &str,
    config: WorkerConfig,
) -> Result<(), SupervisorError> {
    let drain = DrainLoop::new(config.clone());
    let mut shutdown = Box::pin(wait_for_shutdown_signal());
    let mut idle_ticks = 0u32;

    let exit_reason = loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break ExitReason::Shutdown,
            batch = stream.consume_batch(stream_key, config.batch_size, Duration::from_secs(1)) => {
                let entries = batch?;
                for entry in &entries {
                    handle_stream_entry(&stream, entry, &processor, &dlq, &metrics, stream_key).await;
                }

                idle_ticks = if entries.is_empty() { idle_ticks + 1 } else { 0 };
                if idle_ticks >= 30 {
                    idle_ticks = 0;
                    reclaim_stalled(&stream, &processor, &dlq, &metrics, stream_key).await;
                }

                let sleep_for = drain.record_batch(entries.len()).await;
                if entries.is_empty() {
                    tokio::time::sleep(sleep_for).await;
                }
                if let Some(reason) = drain.should_exit().await {
                    break reason;
                }
            }
        }
    };

    tracing::info!(reason = exit_reason.as_str(), "stream worker exiting");
    Ok(())
}

async fn handle_stream_entry(
    stream: &StreamAdapter,
    entry: &event_bus::StreamEntry,
    processor: &EventProcessor,
    dlq: &DeadLetterManager,
    metrics: &MetricsSink,
    stream_key: &str,
) {
    match processor.process(&entry.event, event_bus::EventSource::Stream).await {
        Ok(_) => {
            let _ = stream.ack(stream_key, &entry.entry_id).await;
            metrics.incr_counter("event_acked_total", &[("queue", stream_key)]);
        }
        Err(e) => {
            let next = StreamAttempts(entry.attempts).next();
            if next.exhausted() {
                let dlq_entry = event_bus::stream::dlq_entry(stream_key, &entry.entry_id, &entry.event, &e.to_string(), next.0);
                let _ = stream.send_to_dlq(&dlq_entry).await;
                let _ = dlq.stats().await;
            } else {
                let _ = stream.requeue_with_attempt(stream_key, &entry.event, next.0, &e.to_string()).await;
            }
            let _ = stream.ack(stream_key, &entry.entry_id).await;
        }
    }
}

/// §4.5 claim: recover entries left pending by a crashed consumer.
async fn reclaim_stalled(
    stream: &StreamAdapter,
    processor: &EventProcessor,
    dlq: &DeadLetterManager,
    metrics: &MetricsSink,
    stream_key: &str,
) {
    match stream.claim_pending(stream_key, 10, 30_000).await {
        Ok(entries) => {
            for entry in &entries {
                handle_stream_entry(stream, entry, processor, dlq, metrics, stream_key).await;
            }
        }
        Err(e) => tracing::error!(error = %e, "claim_pending failed"),
    }
}
