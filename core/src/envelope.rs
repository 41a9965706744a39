//! Wire envelope for events crossing the message plane.
//!
//! Every message on the broker is a JSON object `{eventType, data, timestamp}`.
//! The event identifier and correlation identifier do not live in the body:
//! they travel in the AMQP message properties so the consumer pipeline can
//! deduplicate and trace a delivery before it ever parses the payload.
//!
//! # Example
//!
//! ```
//! use souk_core::envelope::EventEnvelope;
//! use serde_json::json;
//!
//! let envelope = EventEnvelope::new(
//!     souk_core::envelope::events::ORDER_CREATED,
//!     json!({"orderId": "o-1", "products": [{"productId": "p-1", "quantity": 2}]}),
//! );
//! assert_eq!(envelope.event_type, "order.created");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Event type names used across the platform.
///
/// Queue names equal event type names; the dead-letter companion of a queue
/// `q` is always `q.dlq`.
pub mod events {
    /// Order persisted in PENDING, inventory should reserve.
    pub const ORDER_CREATED: &str = "order.created";
    /// All lines reserved.
    pub const INVENTORY_RESERVED_SUCCESS: &str = "inventory.reserved.success";
    /// At least one line could not be reserved.
    pub const INVENTORY_RESERVED_FAILED: &str = "inventory.reserved.failed";
    /// Order confirmed, payment should run.
    pub const ORDER_CONFIRMED: &str = "order.confirmed";
    /// Payment captured.
    pub const PAYMENT_SUCCEEDED: &str = "payment.succeeded";
    /// Payment rejected or errored.
    pub const PAYMENT_FAILED: &str = "payment.failed";
    /// Compensation: return a reserved quantity to stock.
    pub const ORDER_RELEASE: &str = "order.release";
    /// Settlement: a paid order's reserved quantity leaves the system.
    pub const ORDER_CONFIRM: &str = "order.confirm";
    /// Order reached CANCELLED (fan-out notification).
    pub const ORDER_CANCELLED: &str = "order.cancelled";
    /// Order sat in PENDING past the deadline.
    pub const ORDER_TIMEOUT: &str = "order.timeout";
    /// A flash-sale buyer won a reservation.
    pub const SECKILL_ORDER_WON: &str = "seckill.order.won";
    /// Compensation: undo a flash-sale reservation.
    pub const SECKILL_RELEASE: &str = "seckill.release";
}

/// The JSON body of every brokered message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Event type, e.g. `order.created`. Also the queue the message rides on
    /// unless a routing key overrides it.
    pub event_type: String,
    /// Event payload. Shape is event-specific and validated per consumer
    /// against a [`crate::schema::MessageSchema`].
    pub data: serde_json::Value,
    /// Producer-side creation time.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    /// Build an envelope stamped with the current time.
    #[must_use]
    pub fn new(event_type: &str, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Per-delivery metadata carried outside the body.
///
/// The consumer pipeline assembles this from the AMQP properties and headers
/// and hands it to the handler together with the validated payload, so nested
/// publishes inherit the correlation identifier and trace context.
#[derive(Debug, Clone)]
pub struct DeliveryMetadata {
    /// Globally unique event identifier; also the idempotency key
    /// (`processed:{event_id}`).
    pub event_id: Uuid,
    /// Correlation identifier linking the whole business operation.
    pub correlation_id: String,
    /// Producer-side timestamp from the envelope.
    pub timestamp: DateTime<Utc>,
    /// Raw message headers (trace context and anything else the producer
    /// attached).
    pub headers: HashMap<String, String>,
}

impl DeliveryMetadata {
    /// Metadata for a locally originated event (fresh ids, empty headers).
    #[must_use]
    pub fn originate(correlation_id: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            correlation_id: correlation_id.into(),
            timestamp: Utc::now(),
            headers: HashMap::new(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_serializes_with_camel_case_tag() {
        let envelope = EventEnvelope::new(events::ORDER_CREATED, json!({"orderId": "o-1"}));
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["eventType"], "order.created");
        assert_eq!(value["data"]["orderId"], "o-1");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn envelope_deserializes_without_timestamp() {
        let raw = r#"{"eventType":"payment.failed","data":{"orderId":"o-2"}}"#;
        let envelope: EventEnvelope = serde_json::from_str(raw).unwrap();

        assert_eq!(envelope.event_type, events::PAYMENT_FAILED);
        assert_eq!(envelope.data["orderId"], "o-2");
    }

    #[test]
    fn originated_metadata_has_fresh_event_id() {
        let a = DeliveryMetadata::originate("corr-1");
        let b = DeliveryMetadata::originate("corr-1");
        assert_ne!(a.event_id, b.event_id);
        assert_eq!(a.correlation_id, "corr-1");
    }
}
