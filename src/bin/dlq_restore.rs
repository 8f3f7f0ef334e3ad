//! Operator CLI for replaying dead-lettered events out of the KV backup list
//! and back onto their original queue (§4.7 restore_from_backup). Intended
//! to be run by hand after an incident, not by the worker supervisor.

use std::sync::Arc;

use clap::Parser;
use event_bus::{BrokerAdapter, DeadLetterManager, InMemoryKv, MetricsSink};

#[path = "../config.rs"]
mod config;

#[derive(Parser, Debug)]
#[command(name = "dlq-restore")]
struct Args {
    /// Repeat until the backup list is empty instead of doing one batch.
    #[arg(long)]
    drain: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())).init();

    let args = Args::parse();
    let cfg = config::Config::from_env()?;

    let broker = BrokerAdapter::connect(&cfg.broker_url, cfg.prefetch).await?;
    // TODO: swap InMemoryKv for event_bus::RedisKv once a dedicated KV
    // endpoint is configured separately from the stream adapter's Redis.
    let kv: Arc<dyn event_bus::KvStore> = Arc::new(InMemoryKv::new());
    let metrics = Arc::new(MetricsSink::new(&cfg.metrics_namespace));
    let dlq = DeadLetterManager::new(&broker, kv, metrics, &cfg.dlq_backup_file);

    let mut total = 0usize;
    loop {
        let restored = dlq.restore_from_backup().await?;
        total += restored;
        tracing::info!(restored, total, "restore batch complete");
        if !args.drain || restored == 0 {
            break;
        }
    }

    println!("restored {total} events from dlq backup");
    Ok(())
}
