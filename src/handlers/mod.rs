//! Handler registry (§4.9, §9): a tagged-union-by-event-type dispatch table
//! populated once at startup. A missing handler for a given type is a no-op,
//! not an error — the registry is immutable after construction, matching the
//! "handler registry is immutable after process start" shared-resource rule.

pub mod login;
pub mod purchase;

use std::collections::HashMap;

use async_trait::async_trait;
use event_bus::Event;

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), String>;

    fn name(&self) -> &'static str;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Vec<Box<dyn EventHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, event_type: &'static str, handler: Box<dyn EventHandler>) {
        self.handlers.entry(event_type).or_default().push(handler);
    }

    pub fn handlers_for(&self, event_type: &str) -> &[Box<dyn EventHandler>] {
        self.handlers.get(event_type).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("purchase", Box::new(purchase::PurchaseHandler));
        registry.register("login", Box::new(login::LoginHandler));
        registry
    }
}
