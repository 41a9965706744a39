//! Inventory-side event handlers.
//!
//! - `order.created`: reserve every line atomically (all lines commit or
//!   none do), or emit `inventory.reserved.failed`. Flash-sale orders skip
//!   reservation: the campaign pool already took the stock, so the record
//!   is blind-decremented and the success event is emitted immediately.
//! - `order.release`: the compensation primitive. `CANNOT_RELEASE` means a
//!   previous delivery already released, so it acks as a no-op.
//! - `order.timeout`: per-item release of a timed-out order's lines;
//!   one line's failure never aborts the remaining compensations.

use crate::store::{InventoryError, InventoryStore};
use async_trait::async_trait;
use serde::Deserialize;
use souk_broker::EventHandler;
use souk_core::envelope::{events, DeliveryMetadata};
use souk_core::error::{HandlerError, HandlerOutcome};
use souk_core::order::{OrderMetadata, OrderSource};
use souk_core::schema::{FieldKind, MessageSchema};
use souk_outbox::{NewOutboxEvent, OutboxStore};
use tracing::{info, warn};
use uuid::Uuid;

/// One product line as carried in event payloads.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinePayload {
    /// Product identifier.
    pub product_id: String,
    /// Quantity.
    pub quantity: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderCreatedPayload {
    order_id: String,
    products: Vec<LinePayload>,
    #[serde(default)]
    metadata: Option<OrderMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReleasePayload {
    order_id: String,
    product_id: String,
    quantity: i64,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimeoutPayload {
    order_id: String,
    products: Vec<LinePayload>,
    #[serde(default)]
    reason: Option<String>,
}

fn parse<T: serde::de::DeserializeOwned>(payload: &serde_json::Value) -> Result<T, HandlerError> {
    serde_json::from_value(payload.clone())
        .map_err(|e| HandlerError::Permanent(format!("payload shape: {e}")))
}

fn classify_db(err: InventoryError) -> HandlerError {
    match err {
        InventoryError::Database(reason) => HandlerError::Transient(reason),
        other => HandlerError::Permanent(other.to_string()),
    }
}

/// Handler for `order.created`: the reservation step of the saga.
pub struct ReservationHandler {
    store: InventoryStore,
    outbox: OutboxStore,
    schema: MessageSchema,
}

impl ReservationHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(store: InventoryStore, outbox: OutboxStore) -> Self {
        Self {
            store,
            outbox,
            schema: MessageSchema::new(events::ORDER_CREATED)
                .field("orderId", FieldKind::String)
                .field("products", FieldKind::Array)
                .optional_field("metadata", FieldKind::Object),
        }
    }

    /// Try to reserve every line in one transaction, enqueueing the success
    /// event in the same transaction. Returns the shortfall reason when the
    /// reservation cannot be satisfied.
    async fn reserve_all(
        &self,
        payload: &OrderCreatedPayload,
        correlation_id: &str,
    ) -> Result<Option<String>, HandlerError> {
        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(HandlerError::transient)?;

        for line in &payload.products {
            match self
                .store
                .reserve_with(&mut *tx, &line.product_id, line.quantity)
                .await
            {
                Ok(record) => {
                    info!(
                        order_id = %payload.order_id,
                        product_id = %line.product_id,
                        quantity = line.quantity,
                        available = record.available,
                        "Line reserved"
                    );
                }
                Err(InventoryError::InsufficientStock { product_id, requested }) => {
                    // Rolling back undoes the lines reserved so far: no
                    // stock leaks on a partial failure.
                    tx.rollback().await.map_err(HandlerError::transient)?;
                    return Ok(Some(format!(
                        "insufficient stock for {product_id} (requested {requested})"
                    )));
                }
                Err(InventoryError::NotFound(product_id)) => {
                    tx.rollback().await.map_err(HandlerError::transient)?;
                    return Ok(Some(format!("no inventory record for {product_id}")));
                }
                Err(InventoryError::Database(reason)) => {
                    return Err(HandlerError::Transient(reason));
                }
                Err(other) => {
                    return Err(HandlerError::Permanent(other.to_string()));
                }
            }
        }

        self.enqueue_result(
            &mut tx,
            events::INVENTORY_RESERVED_SUCCESS,
            payload,
            correlation_id,
            None,
        )
        .await?;
        tx.commit().await.map_err(HandlerError::transient)?;
        Ok(None)
    }

    /// Flash-sale path: the campaign already took the stock; follow with a
    /// blind decrement and confirm immediately.
    async fn debit_all(
        &self,
        payload: &OrderCreatedPayload,
        correlation_id: &str,
    ) -> Result<(), HandlerError> {
        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(HandlerError::transient)?;

        for line in &payload.products {
            self.store
                .debit(&mut *tx, &line.product_id, line.quantity)
                .await
                .map_err(classify_db)?;
        }

        self.enqueue_result(
            &mut tx,
            events::INVENTORY_RESERVED_SUCCESS,
            payload,
            correlation_id,
            None,
        )
        .await?;
        tx.commit().await.map_err(HandlerError::transient)?;
        Ok(())
    }

    async fn enqueue_result(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        event_type: &str,
        payload: &OrderCreatedPayload,
        correlation_id: &str,
        reason: Option<&str>,
    ) -> Result<(), HandlerError> {
        let products: Vec<serde_json::Value> = payload
            .products
            .iter()
            .map(|line| {
                serde_json::json!({"productId": line.product_id, "quantity": line.quantity})
            })
            .collect();

        let mut data = serde_json::json!({
            "orderId": payload.order_id,
            "products": products,
        });
        if let Some(reason) = reason {
            data["reason"] = serde_json::Value::String(reason.to_string());
        }

        self.outbox
            .enqueue(
                tx,
                NewOutboxEvent {
                    event_id: Uuid::new_v4(),
                    event_type: event_type.to_string(),
                    payload: data,
                    correlation_id: correlation_id.to_string(),
                    routing_key: None,
                },
            )
            .await
            .map_err(HandlerError::transient)
    }
}

#[async_trait]
impl EventHandler for ReservationHandler {
    fn name(&self) -> &'static str {
        "inventory-reservation"
    }

    fn schema(&self) -> &MessageSchema {
        &self.schema
    }

    async fn handle(
        &self,
        payload: &serde_json::Value,
        metadata: &DeliveryMetadata,
    ) -> Result<HandlerOutcome, HandlerError> {
        let payload: OrderCreatedPayload = parse(payload)?;
        if payload.products.is_empty() {
            return Err(HandlerError::Permanent("order has no products".into()));
        }

        let source = payload
            .metadata
            .as_ref()
            .map_or(OrderSource::Regular, |m| m.source);

        if source == OrderSource::Seckill {
            self.debit_all(&payload, &metadata.correlation_id).await?;
            info!(order_id = %payload.order_id, "Flash-sale lines debited, reservation confirmed");
            return Ok(HandlerOutcome::Applied);
        }

        match self.reserve_all(&payload, &metadata.correlation_id).await? {
            None => {
                info!(order_id = %payload.order_id, "All lines reserved");
                metrics::counter!("inventory.reservations").increment(1);
                Ok(HandlerOutcome::Applied)
            }
            Some(reason) => {
                warn!(order_id = %payload.order_id, reason, "Reservation failed");
                metrics::counter!("inventory.reservation_failures").increment(1);
                let mut tx = self
                    .store
                    .pool()
                    .begin()
                    .await
                    .map_err(HandlerError::transient)?;
                self.enqueue_result(
                    &mut tx,
                    events::INVENTORY_RESERVED_FAILED,
                    &payload,
                    &metadata.correlation_id,
                    Some(&reason),
                )
                .await?;
                tx.commit().await.map_err(HandlerError::transient)?;
                Ok(HandlerOutcome::Applied)
            }
        }
    }
}

/// Handler for `order.release`: the compensation primitive.
pub struct ReleaseHandler {
    store: InventoryStore,
    schema: MessageSchema,
}

impl ReleaseHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(store: InventoryStore) -> Self {
        Self {
            store,
            schema: MessageSchema::new(events::ORDER_RELEASE)
                .field("orderId", FieldKind::String)
                .field("productId", FieldKind::String)
                .field("quantity", FieldKind::Number)
                .optional_field("reason", FieldKind::String),
        }
    }
}

#[async_trait]
impl EventHandler for ReleaseHandler {
    fn name(&self) -> &'static str {
        "inventory-release"
    }

    fn schema(&self) -> &MessageSchema {
        &self.schema
    }

    async fn handle(
        &self,
        payload: &serde_json::Value,
        _metadata: &DeliveryMetadata,
    ) -> Result<HandlerOutcome, HandlerError> {
        let payload: ReleasePayload = parse(payload)?;

        match self
            .store
            .release(&payload.product_id, payload.quantity)
            .await
        {
            Ok(record) => {
                info!(
                    order_id = %payload.order_id,
                    product_id = %payload.product_id,
                    quantity = payload.quantity,
                    reason = payload.reason.as_deref().unwrap_or("unspecified"),
                    available = record.available,
                    "Reservation released"
                );
                metrics::counter!("inventory.releases").increment(1);
                Ok(HandlerOutcome::Applied)
            }
            // Already released (or never reserved, for seckill orders):
            // compensation converged, nothing to undo.
            Err(InventoryError::CannotRelease { .. } | InventoryError::NotFound(_)) => {
                info!(
                    order_id = %payload.order_id,
                    product_id = %payload.product_id,
                    "Release was a no-op (already released)"
                );
                Ok(HandlerOutcome::NoopAlreadyApplied)
            }
            Err(InventoryError::Database(reason)) => Err(HandlerError::Transient(reason)),
            Err(other) => Err(HandlerError::Permanent(other.to_string())),
        }
    }
}

/// Handler for `order.confirm`: a paid order's reserved units leave the
/// system (`reserved -= qty`). `CANNOT_CONFIRM` acks as already-confirmed,
/// which also covers flash-sale orders that never reserved.
pub struct ConfirmHandler {
    store: InventoryStore,
    schema: MessageSchema,
}

impl ConfirmHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(store: InventoryStore) -> Self {
        Self {
            store,
            schema: MessageSchema::new(events::ORDER_CONFIRM)
                .field("orderId", FieldKind::String)
                .field("productId", FieldKind::String)
                .field("quantity", FieldKind::Number),
        }
    }
}

#[async_trait]
impl EventHandler for ConfirmHandler {
    fn name(&self) -> &'static str {
        "inventory-confirm"
    }

    fn schema(&self) -> &MessageSchema {
        &self.schema
    }

    async fn handle(
        &self,
        payload: &serde_json::Value,
        _metadata: &DeliveryMetadata,
    ) -> Result<HandlerOutcome, HandlerError> {
        let payload: ReleasePayload = parse(payload)?;

        match self
            .store
            .confirm(&payload.product_id, payload.quantity)
            .await
        {
            Ok(record) => {
                info!(
                    order_id = %payload.order_id,
                    product_id = %payload.product_id,
                    quantity = payload.quantity,
                    reserved = record.reserved,
                    "Reservation confirmed (stock left the system)"
                );
                metrics::counter!("inventory.confirms").increment(1);
                Ok(HandlerOutcome::Applied)
            }
            Err(InventoryError::CannotConfirm { .. } | InventoryError::NotFound(_)) => {
                Ok(HandlerOutcome::NoopAlreadyApplied)
            }
            Err(InventoryError::Database(reason)) => Err(HandlerError::Transient(reason)),
            Err(other) => Err(HandlerError::Permanent(other.to_string())),
        }
    }
}

/// Handler for `order.timeout`: release every line of a timed-out order.
pub struct TimeoutHandler {
    store: InventoryStore,
    schema: MessageSchema,
}

impl TimeoutHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(store: InventoryStore) -> Self {
        Self {
            store,
            schema: MessageSchema::new(events::ORDER_TIMEOUT)
                .field("orderId", FieldKind::String)
                .field("products", FieldKind::Array)
                .optional_field("reason", FieldKind::String),
        }
    }
}

#[async_trait]
impl EventHandler for TimeoutHandler {
    fn name(&self) -> &'static str {
        "inventory-timeout"
    }

    fn schema(&self) -> &MessageSchema {
        &self.schema
    }

    async fn handle(
        &self,
        payload: &serde_json::Value,
        _metadata: &DeliveryMetadata,
    ) -> Result<HandlerOutcome, HandlerError> {
        let payload: TimeoutPayload = parse(payload)?;
        let mut transient_failures = 0_u32;

        for line in &payload.products {
            match self.store.release(&line.product_id, line.quantity).await {
                Ok(_) => {
                    info!(
                        order_id = %payload.order_id,
                        product_id = %line.product_id,
                        quantity = line.quantity,
                        "Timed-out line released"
                    );
                }
                Err(InventoryError::CannotRelease { .. } | InventoryError::NotFound(_)) => {
                    // Already compensated; keep going.
                }
                Err(err) => {
                    // One line's failure must not abort the rest; remember
                    // it and requeue afterwards so the released lines are
                    // no-ops on the retry.
                    warn!(
                        order_id = %payload.order_id,
                        product_id = %line.product_id,
                        error = %err,
                        "Timeout compensation for line failed, will retry"
                    );
                    transient_failures += 1;
                }
            }
        }

        if transient_failures > 0 {
            return Err(HandlerError::Transient(format!(
                "{transient_failures} line release(s) failed for order {}",
                payload.order_id
            )));
        }
        Ok(HandlerOutcome::Applied)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn order_created_payload_parses() {
        let payload: OrderCreatedPayload = parse(&json!({
            "orderId": "o-1",
            "products": [
                {"productId": "p-1", "quantity": 2},
                {"productId": "p-2", "quantity": 1},
            ],
            "metadata": {"source": "seckill", "seckillRef": "r-9"},
        }))
        .unwrap();
        assert_eq!(payload.products.len(), 2);
        assert_eq!(payload.metadata.unwrap().source, OrderSource::Seckill);
    }

    #[test]
    fn malformed_line_is_permanent() {
        let result: Result<OrderCreatedPayload, _> = parse(&json!({
            "orderId": "o-1",
            "products": [{"productId": "p-1"}],
        }));
        assert!(matches!(result, Err(HandlerError::Permanent(_))));
    }

    #[test]
    fn release_payload_accepts_missing_reason() {
        let payload: ReleasePayload = parse(&json!({
            "orderId": "o-1",
            "productId": "p-1",
            "quantity": 3,
        }))
        .unwrap();
        assert_eq!(payload.quantity, 3);
        assert!(payload.reason.is_none());
    }

    #[test]
    fn schemas_reject_the_wrong_shapes() {
        let handler_schema = MessageSchema::new(events::ORDER_RELEASE)
            .field("orderId", FieldKind::String)
            .field("productId", FieldKind::String)
            .field("quantity", FieldKind::Number);

        assert!(!handler_schema
            .validate(&json!({"orderId": "o", "productId": "p", "quantity": "three"}))
            .is_empty());
        assert!(handler_schema
            .validate(&json!({"orderId": "o", "productId": "p", "quantity": 3}))
            .is_empty());
    }

    #[test]
    fn database_errors_classify_transient() {
        assert!(classify_db(InventoryError::Database("reset".into())).is_transient());
        assert!(!classify_db(InventoryError::InvalidQuantity(0)).is_transient());
    }
}
