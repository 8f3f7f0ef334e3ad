//! Event schema validation (§3, §6). Out of scope per the project's
//! boundary is a general-purpose schema engine; this is the "straightforward
//! schema check" the boundary calls for, not a rules DSL.

use chrono::Utc;
use event_bus::EventType;

use crate::models::IngestEventRequest;

pub fn validate(request: &IngestEventRequest) -> Vec<String> {
    let mut errors = Vec::new();

    if request.timestamp > Utc::now() {
        errors.push("timestamp must not be in the future".to_string());
    }

    if let Some(priority) = request.priority {
        if priority > 10 {
            errors.push("priority must be between 0 and 10".to_string());
        }
    }

    if let Some(key) = &request.idempotency_key {
        if key.len() != 64 || !key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
            errors.push("idempotency_key must be 64 lowercase hex characters".to_string());
        }
    }

    if matches!(request.event_type, EventType::Purchase) {
        validate_purchase_payload(request, &mut errors);
    }

    if let Some(metadata) = &request.metadata {
        validate_metadata(metadata, &mut errors);
    }

    errors
}

fn validate_purchase_payload(request: &IngestEventRequest, errors: &mut Vec<String>) {
    let amount = request.payload.get("amount").and_then(serde_json::Value::as_f64);
    match amount {
        Some(amount) if amount > 0.0 => {}
        Some(_) => errors.push("payload.amount must be greater than 0".to_string()),
        None => errors.push("payload.amount is required for purchase events".to_string()),
    }

    let currency = request.payload.get("currency").and_then(serde_json::Value::as_str);
    match currency {
        Some(currency) if currency.len() == 3 => {}
        Some(_) => errors.push("payload.currency must be a 3-character code".to_string()),
        None => errors.push("payload.currency is required for purchase events".to_string()),
    }
}

fn validate_metadata(metadata: &serde_json::Value, errors: &mut Vec<String>) {
    let Some(platform) = metadata.get("platform").and_then(serde_json::Value::as_str) else {
        return;
    };
    if !matches!(platform, "ios" | "android" | "web") {
        errors.push("metadata.platform must be one of ios, android, web".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn base_request() -> IngestEventRequest {
        IngestEventRequest {
            user_id: Uuid::now_v7(),
            event_type: EventType::Click,
            custom_type: None,
            timestamp: Utc::now(),
            payload: json!({}),
            metadata: None,
            priority: None,
            idempotency_key: None,
        }
    }

    #[test]
    fn purchase_missing_amount_is_rejected() {
        let mut request = base_request();
        request.event_type = EventType::Purchase;
        request.payload = json!({"currency": "USD"});
        let errors = validate(&request);
        assert!(errors.iter().any(|e| e.contains("amount")));
    }

    #[test]
    fn valid_purchase_passes() {
        let mut request = base_request();
        request.event_type = EventType::Purchase;
        request.payload = json!({"amount": 50, "currency": "USD"});
        assert!(validate(&request).is_empty());
    }

    #[test]
    fn future_timestamp_is_rejected() {
        let mut request = base_request();
        request.timestamp = Utc::now() + chrono::Duration::days(1);
        let errors = validate(&request);
        assert!(errors.iter().any(|e| e.contains("timestamp")));
    }

    #[test]
    fn malformed_idempotency_key_is_rejected() {
        let mut request = base_request();
        request.idempotency_key = Some("not-hex".to_string());
        let errors = validate(&request);
        assert!(errors.iter().any(|e| e.contains("idempotency_key")));
    }

    #[test]
    fn invalid_platform_is_rejected() {
        let mut request = base_request();
        request.metadata = Some(json!({"platform": "desktop"}));
        let errors = validate(&request);
        assert!(errors.iter().any(|e| e.contains("platform")));
    }
}
