use async_trait::async_trait;
use event_bus::Event;

use super::EventHandler;

pub struct LoginHandler;

#[async_trait]
impl EventHandler for LoginHandler {
    async fn handle(&self, event: &Event) -> Result<(), String> {
        tracing::info!(event_id = %event.id, user_id = %event.user_id, "login handler invoked");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "login_handler"
    }
}
