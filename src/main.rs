mod broker_pool;
mod config;
mod db;
mod errors;
mod handlers;
mod ingest;
mod middleware;
mod models;
mod processor;
mod routes;
mod state;
mod supervisor;
mod validation;

use std::sync::Arc;

use axum::middleware::{from_fn, from_fn_with_state};
use event_bus::{BreakerRegistry, BrokerAdapter, DeadLetterManager, InMemoryKv, MetricsSink, PriorityRouter, StreamAdapter};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use broker_pool::BrokerPool;
use ingest::IngestService;
use state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,analytics_ingest=debug".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let cfg = config::Config::from_env()?;
    tracing::info!("config loaded");

    let pool = db::create_pool(&cfg.database_url).await?;
    db::run_migrations(&pool).await?;
    tracing::info!("db connected + migrations applied");

    let broker = Arc::new(BrokerAdapter::connect(&cfg.broker_url, cfg.prefetch).await?);
    let stream = Arc::new(StreamAdapter::connect(&cfg.stream_url).await?);
    tracing::info!("broker + stream connected");

    let broker_pool = BrokerPool::new(broker.clone(), stream.clone());
    let metrics = Arc::new(MetricsSink::new(&cfg.metrics_namespace));
    let metrics_for_middleware = metrics.clone();
    let breakers = BreakerRegistry::new();
    // TODO: swap InMemoryKv for event_bus::RedisKv once a dedicated KV
    // endpoint is configured separately from the stream adapter's Redis.
    let kv: Arc<dyn event_bus::KvStore> = Arc::new(InMemoryKv::new());
    let dlq = Arc::new(DeadLetterManager::new(&broker, kv.clone(), metrics.clone(), &cfg.dlq_backup_file));
    let router = PriorityRouter::new(metrics.clone());

    let app_state = Arc::new(AppState {
        db: pool.clone(),
        pool: broker_pool.clone(),
        ingest: IngestService {
            db: pool,
            router: router.clone(),
            breakers: breakers.clone(),
            kv: kv.clone(),
            dlq: dlq.clone(),
            pool: broker_pool,
        },
        breakers,
        metrics,
        dlq,
        kv,
        router,
    });

    let app = routes::router(app_state)
        .layer(from_fn_with_state(metrics_for_middleware, middleware::metrics::metrics_middleware))
        .layer(from_fn(middleware::tracing_mw::trace_id_middleware))
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
