//! The `seckill.release` consumer.
//!
//! When the saga cancels a flash-sale order (payment failed), compensation
//! routes back here instead of the inventory service: the release script
//! removes the buyer's win and credits the campaign stock, atomically and
//! idempotently.

use crate::engine::{SeckillEngine, SeckillError};
use async_trait::async_trait;
use serde::Deserialize;
use souk_broker::EventHandler;
use souk_core::envelope::{events, DeliveryMetadata};
use souk_core::error::{HandlerError, HandlerOutcome};
use souk_core::schema::{FieldKind, MessageSchema};
use tracing::info;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeckillReleasePayload {
    product_id: String,
    user_id: String,
    quantity: i64,
    #[serde(default)]
    reason: Option<String>,
}

/// Handler for `seckill.release`.
pub struct SeckillReleaseHandler {
    engine: SeckillEngine,
    schema: MessageSchema,
}

impl SeckillReleaseHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(engine: SeckillEngine) -> Self {
        Self {
            engine,
            schema: MessageSchema::new(events::SECKILL_RELEASE)
                .field("productId", FieldKind::String)
                .field("userId", FieldKind::String)
                .field("quantity", FieldKind::Number)
                .optional_field("orderId", FieldKind::String)
                .optional_field("reason", FieldKind::String),
        }
    }
}

#[async_trait]
impl EventHandler for SeckillReleaseHandler {
    fn name(&self) -> &'static str {
        "seckill-release"
    }

    fn schema(&self) -> &MessageSchema {
        &self.schema
    }

    async fn handle(
        &self,
        payload: &serde_json::Value,
        _metadata: &DeliveryMetadata,
    ) -> Result<HandlerOutcome, HandlerError> {
        let payload: SeckillReleasePayload = serde_json::from_value(payload.clone())
            .map_err(|e| HandlerError::Permanent(format!("payload shape: {e}")))?;

        match self
            .engine
            .release(&payload.product_id, &payload.user_id, payload.quantity)
            .await
        {
            Ok(true) => {
                info!(
                    product_id = %payload.product_id,
                    user_id = %payload.user_id,
                    quantity = payload.quantity,
                    reason = payload.reason.as_deref().unwrap_or("unspecified"),
                    "Flash-sale win released"
                );
                metrics::counter!("seckill.releases").increment(1);
                Ok(HandlerOutcome::Applied)
            }
            // The user held no win: a replay, or a release racing another.
            Ok(false) => Ok(HandlerOutcome::NoopAlreadyApplied),
            Err(SeckillError::Store(reason)) => Err(HandlerError::Transient(reason)),
            Err(other) => Err(HandlerError::Permanent(other.to_string())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn release_payload_parses() {
        let payload: SeckillReleasePayload = serde_json::from_value(json!({
            "orderId": "o-1",
            "productId": "p-1",
            "userId": "u-1",
            "quantity": 1,
            "reason": "payment failed",
        }))
        .unwrap();
        assert_eq!(payload.quantity, 1);
        assert_eq!(payload.user_id, "u-1");
    }
}
