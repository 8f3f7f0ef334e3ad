//! Standalone worker process (C10): drains one back-end's queues until a
//! shutdown signal, uptime cap, memory cap, or restart-flag tells it to
//! exit. A process supervisor outside this binary is expected to relaunch
//! it — see `supervisor::run_broker_worker`/`run_stream_worker`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use event_bus::{BrokerAdapter, DeadLetterManager, InMemoryKv, MetricsSink, RetryManager, StreamAdapter};

#[path = "../config.rs"]
mod config;
#[path = "../db.rs"]
mod db;
#[path = "../errors.rs"]
mod errors;
#[path = "../handlers/mod.rs"]
mod handlers;
#[path = "../processor.rs"]
mod processor;
#[path = "../supervisor.rs"]
mod supervisor;

use processor::EventProcessor;
use supervisor::WorkerConfig;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendArg {
    Broker,
    Stream,
}

#[derive(Parser, Debug)]
#[command(name = "analytics-worker")]
struct Args {
    /// Which back-end this process drains.
    #[arg(long, value_enum)]
    backend: BackendArg,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().json().with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())).init();

    let args = Args::parse();
    let cfg = config::Config::from_env()?;

    let db = db::create_pool(&cfg.database_url).await?;

    let metrics = Arc::new(MetricsSink::new(&cfg.metrics_namespace));
    // TODO: swap InMemoryKv for event_bus::RedisKv once a dedicated KV
    // endpoint is configured separately from the stream adapter's Redis.
    let kv: Arc<dyn event_bus::KvStore> = Arc::new(InMemoryKv::new());
    let retry = Arc::new(RetryManager::new(kv.clone()));
    let handlers = handlers::HandlerRegistry::with_defaults();
    let processor = Arc::new(EventProcessor { db, kv: kv.clone(), handlers, metrics: metrics.clone() });

    let worker_config = WorkerConfig {
        batch_size: cfg.batch_size,
        poll_sleep_s: cfg.poll_sleep_s,
        memory_cap_mb: cfg.memory_cap_mb,
        max_uptime_s: cfg.max_uptime_s,
        restart_flag_path: PathBuf::from(&cfg.restart_flag_path),
    };

    match args.backend {
        BackendArg::Broker => {
            let broker = Arc::new(BrokerAdapter::connect(&cfg.broker_url, cfg.prefetch).await?);
            let dlq = Arc::new(DeadLetterManager::new(&broker, kv.clone(), metrics.clone(), &cfg.dlq_backup_file));

            let high = tokio::spawn(supervisor::run_broker_worker(
                broker.clone(),
                processor.clone(),
                retry.clone(),
                dlq.clone(),
                metrics.clone(),
                event_bus::broker::QUEUE_HIGH,
                worker_config.clone(),
            ));
            let normal = tokio::spawn(supervisor::run_broker_worker(
                broker,
                processor,
                retry,
                dlq,
                metrics,
                event_bus::broker::QUEUE_NORMAL,
                worker_config,
            ));

            high.await??;
            normal.await??;
        }
        BackendArg::Stream => {
            let stream = Arc::new(StreamAdapter::connect(&cfg.stream_url).await?);
            let broker = Arc::new(BrokerAdapter::connect(&cfg.broker_url, cfg.prefetch).await?);
            let dlq = Arc::new(DeadLetterManager::new(&broker, kv.clone(), metrics.clone(), &cfg.dlq_backup_file));

            let high = tokio::spawn(supervisor::run_stream_worker(
                stream.clone(),
                processor.clone(),
                dlq.clone(),
                metrics.clone(),
                event_bus::stream::STREAM_HIGH,
                worker_config.clone(),
            ));
            let normal = tokio::spawn(supervisor::run_stream_worker(
                stream,
                processor,
                dlq,
                metrics,
                event_bus::stream::STREAM_NORMAL,
                worker_config,
            ));

            high.await??;
            normal.await??;
        }
    }

    Ok(())
}
