//! The event envelope that flows end to end: HTTP intake, broker/stream wire
//! body, and the row ultimately written to the event store.
//!
//! Field set and lifecycle follow the data model: `pending` at intake,
//! `processing` once a consumer picks it up, and a terminal `processed` or
//! `failed`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Click,
    View,
    Purchase,
    Login,
    Logout,
    Signup,
    Subscription,
    Payment,
    Custom,
}

impl EventType {
    /// Priority implied by type alone, used when the caller omits `priority`.
    pub fn default_priority(self) -> u8 {
        match self {
            EventType::Purchase | EventType::Subscription | EventType::Payment => 9,
            EventType::Login | EventType::Logout | EventType::Signup => 5,
            _ => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Click => "click",
            EventType::View => "view",
            EventType::Purchase => "purchase",
            EventType::Login => "login",
            EventType::Logout => "logout",
            EventType::Signup => "signup",
            EventType::Subscription => "subscription",
            EventType::Payment => "payment",
            EventType::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl Default for EventStatus {
    fn default() -> Self {
        EventStatus::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Api,
    Broker,
    Stream,
}

impl Default for EventSource {
    fn default() -> Self {
        EventSource::Api
    }
}

impl EventSource {
    pub fn as_str(self) -> &'static str {
        match self {
            EventSource::Api => "api",
            EventSource::Broker => "broker",
            EventSource::Stream => "stream",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub user_id: Uuid,
    pub event_type: EventType,
    /// Free-text type tag, populated only when `event_type == Custom`. Lets
    /// the router match names outside the closed set (e.g. "refund",
    /// "credit_card_added") without widening `EventType` itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_type: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub source: EventSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_message_id: Option<String>,
    #[serde(default)]
    pub status: EventStatus,
    #[serde(default)]
    pub retry_count: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

impl Event {
    /// The name the router and handler registry key off of: the fixed
    /// variant name, or the custom tag for `Custom` events.
    pub fn type_name(&self) -> &str {
        match (&self.event_type, &self.custom_type) {
            (EventType::Custom, Some(tag)) => tag.as_str(),
            _ => self.event_type.as_str(),
        }
    }

    pub fn is_high_priority(&self) -> bool {
        const HIGH_TYPES: &[&str] = &[
            "purchase",
            "subscription",
            "payment",
            "refund",
            "credit_card_added",
        ];

        if HIGH_TYPES.contains(&self.type_name()) {
            return true;
        }
        if self.priority >= 8 {
            return true;
        }
        if self.event_type == EventType::Purchase {
            if let Some(amount) = self.payload.get("amount").and_then(JsonValue::as_f64) {
                if amount >= 100.0 {
                    return true;
                }
            }
        }
        false
    }
}

/// Stream DLQ entry layout (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamDlqEntry {
    pub original_message_id: String,
    pub original_stream: String,
    pub event: JsonValue,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    pub attempts: u32,
}
