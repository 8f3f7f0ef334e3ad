//! Bundles the two back-end adapters behind one handle so the ingest facade
//! and the worker supervisor can both take `Arc<BrokerPool>` instead of
//! threading two separate adapter arguments everywhere.

use std::sync::Arc;

use event_bus::{BrokerAdapter, StreamAdapter};

#[derive(Clone)]
pub struct BrokerPool {
    pub broker: Arc<BrokerAdapter>,
    pub stream: Arc<StreamAdapter>,
}

impl BrokerPool {
    pub fn new(broker: Arc<BrokerAdapter>, stream: Arc<StreamAdapter>) -> Self {
        Self { broker, stream }
    }
}
