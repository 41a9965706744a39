//! The `order.confirmed` consumer.
//!
//! Charges through the gateway and records the outcome plus its
//! announcement event in one transaction. Declines are outcomes, not
//! errors: the handler persists a FAILED payment and emits
//! `payment.failed` with the order's lines so compensation can run.

use crate::gateway::{GatewayError, PaymentGateway};
use crate::store::{PaymentRecord, PaymentStatus, PaymentStore, PaymentStoreError};
use async_trait::async_trait;
use serde::Deserialize;
use souk_broker::EventHandler;
use souk_core::envelope::{events, DeliveryMetadata};
use souk_core::error::{HandlerError, HandlerOutcome};
use souk_core::schema::{FieldKind, MessageSchema};
use souk_outbox::{NewOutboxEvent, OutboxStore};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderConfirmedPayload {
    order_id: String,
    /// Total in cents.
    total_price: i64,
    #[serde(default)]
    currency: Option<String>,
    user_id: String,
    #[serde(default)]
    products: Vec<serde_json::Value>,
}

fn classify_store(err: PaymentStoreError) -> HandlerError {
    let PaymentStoreError::Database(reason) = err;
    HandlerError::Transient(reason)
}

/// Handler for `order.confirmed`.
pub struct OrderConfirmedHandler {
    store: PaymentStore,
    outbox: OutboxStore,
    gateway: Arc<dyn PaymentGateway>,
    schema: MessageSchema,
}

impl OrderConfirmedHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(store: PaymentStore, outbox: OutboxStore, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self {
            store,
            outbox,
            gateway,
            schema: MessageSchema::new(events::ORDER_CONFIRMED)
                .field("orderId", FieldKind::String)
                .field("totalPrice", FieldKind::Number)
                .field("userId", FieldKind::String)
                .optional_field("currency", FieldKind::String)
                .optional_field("products", FieldKind::Array),
        }
    }

    /// Persist the outcome and enqueue its announcement atomically.
    async fn record_outcome(
        &self,
        record: &PaymentRecord,
        announcement: NewOutboxEvent,
    ) -> Result<(), HandlerError> {
        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(HandlerError::transient)?;
        self.store
            .insert(&mut tx, record)
            .await
            .map_err(classify_store)?;
        self.outbox
            .enqueue(&mut tx, announcement)
            .await
            .map_err(HandlerError::transient)?;
        tx.commit().await.map_err(HandlerError::transient)
    }
}

#[async_trait]
impl EventHandler for OrderConfirmedHandler {
    fn name(&self) -> &'static str {
        "payment-order-confirmed"
    }

    fn schema(&self) -> &MessageSchema {
        &self.schema
    }

    async fn handle(
        &self,
        payload: &serde_json::Value,
        metadata: &DeliveryMetadata,
    ) -> Result<HandlerOutcome, HandlerError> {
        let payload: OrderConfirmedPayload = serde_json::from_value(payload.clone())
            .map_err(|e| HandlerError::Permanent(format!("payload shape: {e}")))?;
        let order_id = Uuid::parse_str(&payload.order_id)
            .map_err(|e| HandlerError::Permanent(format!("orderId: {e}")))?;
        let currency = payload.currency.clone().unwrap_or_else(|| "USD".to_string());

        // Cross-event idempotency: an order is charged at most once, even
        // if `order.confirmed` is replayed under a fresh event id.
        if self
            .store
            .has_succeeded(order_id)
            .await
            .map_err(classify_store)?
        {
            info!(order_id = %order_id, "Order already charged, skipping");
            return Ok(HandlerOutcome::NoopAlreadyApplied);
        }

        match self
            .gateway
            .charge(order_id, &payload.user_id, payload.total_price, &currency)
            .await
        {
            Ok(receipt) => {
                let record = PaymentRecord {
                    id: Uuid::new_v4(),
                    order_id,
                    amount_cents: payload.total_price,
                    currency: currency.clone(),
                    transaction_id: Some(receipt.transaction_id.clone()),
                    status: PaymentStatus::Succeeded,
                    failure_reason: None,
                    created_at: chrono::Utc::now(),
                };
                let announcement = NewOutboxEvent {
                    event_id: Uuid::new_v4(),
                    event_type: events::PAYMENT_SUCCEEDED.to_string(),
                    payload: serde_json::json!({
                        "orderId": order_id,
                        "transactionId": receipt.transaction_id,
                        "amount": payload.total_price,
                        "currency": currency,
                    }),
                    correlation_id: metadata.correlation_id.clone(),
                    routing_key: None,
                };
                self.record_outcome(&record, announcement).await?;
                info!(order_id = %order_id, "Payment captured");
                metrics::counter!("payment.captured").increment(1);
                Ok(HandlerOutcome::Applied)
            }
            Err(GatewayError::Declined(reason)) => {
                let record = PaymentRecord {
                    id: Uuid::new_v4(),
                    order_id,
                    amount_cents: payload.total_price,
                    currency: currency.clone(),
                    transaction_id: None,
                    status: PaymentStatus::Failed,
                    failure_reason: Some(reason.clone()),
                    created_at: chrono::Utc::now(),
                };
                let announcement = NewOutboxEvent {
                    event_id: Uuid::new_v4(),
                    event_type: events::PAYMENT_FAILED.to_string(),
                    payload: serde_json::json!({
                        "orderId": order_id,
                        "reason": reason,
                        "products": payload.products,
                    }),
                    correlation_id: metadata.correlation_id.clone(),
                    routing_key: None,
                };
                self.record_outcome(&record, announcement).await?;
                warn!(order_id = %order_id, reason, "Payment declined");
                metrics::counter!("payment.declined").increment(1);
                Ok(HandlerOutcome::Applied)
            }
            Err(err) if err.is_retryable() => Err(HandlerError::Transient(err.to_string())),
            Err(err) => Err(HandlerError::Permanent(err.to_string())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn confirmed_payload_parses() {
        let payload: OrderConfirmedPayload = serde_json::from_value(json!({
            "orderId": "5f6c0f23-0b2e-4b5e-9af5-2d5e86f0a111",
            "totalPrice": 2500,
            "currency": "USD",
            "userId": "u-1",
            "products": [{"productId": "p-1", "quantity": 2}],
        }))
        .unwrap();
        assert_eq!(payload.total_price, 2500);
        assert_eq!(payload.products.len(), 1);
    }

    #[test]
    fn currency_defaults_when_absent() {
        let payload: OrderConfirmedPayload = serde_json::from_value(json!({
            "orderId": "5f6c0f23-0b2e-4b5e-9af5-2d5e86f0a111",
            "totalPrice": 100,
            "userId": "u-1",
        }))
        .unwrap();
        assert!(payload.currency.is_none());
        assert!(payload.products.is_empty());
    }
}
