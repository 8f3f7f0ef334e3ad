use async_trait::async_trait;
use event_bus::Event;

use super::EventHandler;

/// Placeholder business handler: the business logic behind a purchase event
/// (fulfillment, receipts, ledger entries) is out of scope here, addressed
/// only by this interface contract, per the project's external-collaborator
/// boundary.
pub struct PurchaseHandler;

#[async_trait]
impl EventHandler for PurchaseHandler {
    async fn handle(&self, event: &Event) -> Result<(), String> {
        let amount = event.payload.get("amount").and_then(serde_json::Value::as_f64);
        tracing::info!(event_id = %event.id, ?amount, "purchase handler invoked");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "purchase_handler"
    }
}
