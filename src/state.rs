use std::sync::Arc;

use event_bus::{BreakerRegistry, DeadLetterManager, KvStore, MetricsSink, PriorityRouter};
use sqlx::PgPool;

use crate::broker_pool::BrokerPool;
use crate::ingest::IngestService;

pub struct AppState {
    pub db: PgPool,
    pub pool: BrokerPool,
    pub ingest: IngestService,
    pub breakers: BreakerRegistry,
    pub metrics: Arc<MetricsSink>,
    pub dlq: Arc<DeadLetterManager>,
    pub kv: Arc<dyn KvStore>,
    pub router: PriorityRouter,
}
