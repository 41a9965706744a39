//! Saga event handlers of the order service.
//!
//! Every handler follows the same body: load the order (missing → log and
//! ack), run the pure state machine, and, when the transition is legal,
//! mutate the order and enqueue the follow-on outbox events inside one
//! transaction. The status write is guarded by the expected source status,
//! so a concurrent transition turns into a requeue-and-re-evaluate instead
//! of a lost update.
//!
//! Two rules from the compensation design live here:
//!
//! - `inventory.reserved.success` arriving after the order was cancelled
//!   (another line's failure won the race) emits one `order.release` per
//!   delivered line so the reservation is not leaked.
//! - `payment.failed` emits one release per reserved line before the order
//!   reaches CANCELLED; flash-sale orders route that compensation to
//!   `seckill.release` instead of the inventory service.

use crate::store::{OrderStore, OrderStoreError};
use async_trait::async_trait;
use serde::Deserialize;
use souk_broker::EventHandler;
use souk_core::envelope::{events, DeliveryMetadata};
use souk_core::error::{HandlerError, HandlerOutcome};
use souk_core::order::{Order, OrderItem, OrderMetadata, OrderSource, OrderStatus};
use souk_core::saga::{self, SagaTrigger, TransitionError};
use souk_core::schema::{FieldKind, MessageSchema};
use souk_outbox::{NewOutboxEvent, OutboxStore};
use tracing::{info, warn};
use uuid::Uuid;

fn parse<T: serde::de::DeserializeOwned>(payload: &serde_json::Value) -> Result<T, HandlerError> {
    serde_json::from_value(payload.clone())
        .map_err(|e| HandlerError::Permanent(format!("payload shape: {e}")))
}

fn parse_order_id(raw: &str) -> Result<Uuid, HandlerError> {
    Uuid::parse_str(raw).map_err(|e| HandlerError::Permanent(format!("orderId: {e}")))
}

fn classify_store(err: OrderStoreError) -> HandlerError {
    match err {
        OrderStoreError::Database(reason) => HandlerError::Transient(reason),
        corrupt @ OrderStoreError::Corrupt { .. } => HandlerError::Permanent(corrupt.to_string()),
    }
}

/// Shared handler dependencies plus the event constructors.
#[derive(Clone)]
pub struct SagaDeps {
    store: OrderStore,
    outbox: OutboxStore,
}

impl SagaDeps {
    /// Bundle the stores the handlers share.
    #[must_use]
    pub const fn new(store: OrderStore, outbox: OutboxStore) -> Self {
        Self { store, outbox }
    }

    async fn load(&self, order_id: Uuid) -> Result<Option<Order>, HandlerError> {
        self.store.fetch(order_id).await.map_err(classify_store)
    }

    fn release_event(
        order: &Order,
        product_id: &str,
        quantity: i64,
        reason: &str,
        correlation_id: &str,
    ) -> NewOutboxEvent {
        NewOutboxEvent {
            event_id: Uuid::new_v4(),
            event_type: events::ORDER_RELEASE.to_string(),
            payload: serde_json::json!({
                "orderId": order.id,
                "productId": product_id,
                "quantity": quantity,
                "reason": reason,
            }),
            correlation_id: correlation_id.to_string(),
            routing_key: None,
        }
    }

    fn seckill_release_event(
        order: &Order,
        product_id: &str,
        quantity: i64,
        reason: &str,
        correlation_id: &str,
    ) -> NewOutboxEvent {
        NewOutboxEvent {
            event_id: Uuid::new_v4(),
            event_type: events::SECKILL_RELEASE.to_string(),
            payload: serde_json::json!({
                "orderId": order.id,
                "productId": product_id,
                "userId": order.user_id,
                "quantity": quantity,
                "reason": reason,
            }),
            correlation_id: correlation_id.to_string(),
            routing_key: None,
        }
    }

    fn cancelled_event(order: &Order, reason: &str, correlation_id: &str) -> NewOutboxEvent {
        NewOutboxEvent {
            event_id: Uuid::new_v4(),
            event_type: events::ORDER_CANCELLED.to_string(),
            payload: serde_json::json!({
                "orderId": order.id,
                "reason": reason,
            }),
            correlation_id: correlation_id.to_string(),
            routing_key: None,
        }
    }

    /// Compensation events for every reserved line; flash-sale orders go
    /// back to the campaign pool instead of the inventory service.
    fn compensation_events(
        order: &Order,
        reason: &str,
        correlation_id: &str,
    ) -> Vec<NewOutboxEvent> {
        order
            .reserved_items()
            .map(|item| {
                if order.metadata.source == OrderSource::Seckill {
                    Self::seckill_release_event(
                        order,
                        &item.product_id,
                        item.quantity,
                        reason,
                        correlation_id,
                    )
                } else {
                    Self::release_event(
                        order,
                        &item.product_id,
                        item.quantity,
                        reason,
                        correlation_id,
                    )
                }
            })
            .collect()
    }

    /// The common transactional tail: guarded status write, follow-on
    /// events, commit.
    async fn commit_transition(
        &self,
        order: &Order,
        to: OrderStatus,
        cancellation_reason: Option<&str>,
        items: Option<&[OrderItem]>,
        follow_ons: Vec<NewOutboxEvent>,
    ) -> Result<(), HandlerError> {
        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(HandlerError::transient)?;

        let moved = self
            .store
            .transition(&mut tx, order.id, order.status, to, cancellation_reason, items)
            .await
            .map_err(classify_store)?;
        if !moved {
            // The order moved between our read and this write; requeue so
            // the state machine re-evaluates against the fresh status.
            tx.rollback().await.map_err(HandlerError::transient)?;
            return Err(HandlerError::Transient(format!(
                "order {} changed concurrently, re-evaluating",
                order.id
            )));
        }

        for event in follow_ons {
            self.outbox
                .enqueue(&mut tx, event)
                .await
                .map_err(HandlerError::transient)?;
        }

        tx.commit().await.map_err(HandlerError::transient)?;
        metrics::counter!("order.transitions", "to" => to.as_str()).increment(1);
        Ok(())
    }

    /// Enqueue events without touching the order (compensation-only paths).
    async fn emit_only(&self, follow_ons: Vec<NewOutboxEvent>) -> Result<(), HandlerError> {
        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(HandlerError::transient)?;
        for event in follow_ons {
            self.outbox
                .enqueue(&mut tx, event)
                .await
                .map_err(HandlerError::transient)?;
        }
        tx.commit().await.map_err(HandlerError::transient)
    }
}

//
// ===== inventory.reserved.success =====
//

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReservedSuccessPayload {
    order_id: String,
    products: Vec<ProductLine>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductLine {
    product_id: String,
    quantity: i64,
}

/// PENDING → CONFIRMED on successful reservation.
pub struct ReservedSuccessHandler {
    deps: SagaDeps,
    schema: MessageSchema,
}

impl ReservedSuccessHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(deps: SagaDeps) -> Self {
        Self {
            deps,
            schema: MessageSchema::new(events::INVENTORY_RESERVED_SUCCESS)
                .field("orderId", FieldKind::String)
                .field("products", FieldKind::Array),
        }
    }
}

#[async_trait]
impl EventHandler for ReservedSuccessHandler {
    fn name(&self) -> &'static str {
        "order-reserved-success"
    }

    fn schema(&self) -> &MessageSchema {
        &self.schema
    }

    async fn handle(
        &self,
        payload: &serde_json::Value,
        metadata: &DeliveryMetadata,
    ) -> Result<HandlerOutcome, HandlerError> {
        let payload: ReservedSuccessPayload = parse(payload)?;
        let order_id = parse_order_id(&payload.order_id)?;

        let Some(order) = self.deps.load(order_id).await? else {
            warn!(order_id = %order_id, "Reservation success for unknown order, acknowledging");
            return Ok(HandlerOutcome::NoopStale);
        };

        match saga::apply(order.status, SagaTrigger::InventoryReserved) {
            Ok(next) => {
                let mut items = order.items.clone();
                for item in &mut items {
                    item.reserved = true;
                }

                let confirmed = NewOutboxEvent {
                    event_id: Uuid::new_v4(),
                    event_type: events::ORDER_CONFIRMED.to_string(),
                    payload: serde_json::json!({
                        "orderId": order.id,
                        "totalPrice": order.total_price_cents,
                        "currency": "USD",
                        "userId": order.user_id,
                        "products": items.iter().map(|item| serde_json::json!({
                            "productId": item.product_id,
                            "quantity": item.quantity,
                        })).collect::<Vec<_>>(),
                    }),
                    correlation_id: metadata.correlation_id.clone(),
                    routing_key: None,
                };

                self.deps
                    .commit_transition(&order, next, None, Some(&items), vec![confirmed])
                    .await?;
                info!(order_id = %order.id, "Order confirmed");
                Ok(HandlerOutcome::Applied)
            }
            Err(TransitionError::AlreadyInTarget { .. }) => Ok(HandlerOutcome::NoopAlreadyApplied),
            Err(TransitionError::Stale {
                current: OrderStatus::Cancelled,
                ..
            }) => {
                // The order lost a race (another line failed, or it timed
                // out) while inventory was still reserving. The stock is
                // held with no live order behind it: release every
                // delivered line.
                let releases: Vec<NewOutboxEvent> = payload
                    .products
                    .iter()
                    .map(|line| {
                        SagaDeps::release_event(
                            &order,
                            &line.product_id,
                            line.quantity,
                            "order already cancelled",
                            &metadata.correlation_id,
                        )
                    })
                    .collect();
                warn!(
                    order_id = %order.id,
                    lines = releases.len(),
                    "Reservation succeeded for a cancelled order, compensating"
                );
                self.deps.emit_only(releases).await?;
                Ok(HandlerOutcome::Applied)
            }
            Err(TransitionError::Stale { .. }) => Ok(HandlerOutcome::NoopStale),
            Err(illegal @ TransitionError::Illegal { .. }) => {
                Err(HandlerError::Permanent(illegal.to_string()))
            }
        }
    }
}

//
// ===== inventory.reserved.failed =====
//

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReservedFailedPayload {
    order_id: String,
    #[serde(default)]
    reason: Option<String>,
}

/// PENDING → CANCELLED on reservation failure.
pub struct ReservedFailedHandler {
    deps: SagaDeps,
    schema: MessageSchema,
}

impl ReservedFailedHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(deps: SagaDeps) -> Self {
        Self {
            deps,
            schema: MessageSchema::new(events::INVENTORY_RESERVED_FAILED)
                .field("orderId", FieldKind::String)
                .field("products", FieldKind::Array)
                .optional_field("reason", FieldKind::String),
        }
    }
}

#[async_trait]
impl EventHandler for ReservedFailedHandler {
    fn name(&self) -> &'static str {
        "order-reserved-failed"
    }

    fn schema(&self) -> &MessageSchema {
        &self.schema
    }

    async fn handle(
        &self,
        payload: &serde_json::Value,
        metadata: &DeliveryMetadata,
    ) -> Result<HandlerOutcome, HandlerError> {
        let payload: ReservedFailedPayload = parse(payload)?;
        let order_id = parse_order_id(&payload.order_id)?;

        let Some(order) = self.deps.load(order_id).await? else {
            warn!(order_id = %order_id, "Reservation failure for unknown order, acknowledging");
            return Ok(HandlerOutcome::NoopStale);
        };

        match saga::apply(order.status, SagaTrigger::InventoryFailed) {
            Ok(next) => {
                let reason = format!(
                    "inventory reservation failed: {}",
                    payload.reason.as_deref().unwrap_or("unspecified")
                );
                let cancelled = SagaDeps::cancelled_event(&order, &reason, &metadata.correlation_id);
                self.deps
                    .commit_transition(&order, next, Some(&reason), None, vec![cancelled])
                    .await?;
                info!(order_id = %order.id, reason, "Order cancelled");
                Ok(HandlerOutcome::Applied)
            }
            Err(TransitionError::AlreadyInTarget { .. }) => Ok(HandlerOutcome::NoopAlreadyApplied),
            Err(TransitionError::Stale { .. }) => Ok(HandlerOutcome::NoopStale),
            Err(illegal @ TransitionError::Illegal { .. }) => {
                Err(HandlerError::Permanent(illegal.to_string()))
            }
        }
    }
}

//
// ===== payment.succeeded =====
//

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentSucceededPayload {
    order_id: String,
    transaction_id: String,
}

/// CONFIRMED → PAID on captured payment; confirms the reservation so the
/// stock leaves the system.
pub struct PaymentSucceededHandler {
    deps: SagaDeps,
    schema: MessageSchema,
}

impl PaymentSucceededHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(deps: SagaDeps) -> Self {
        Self {
            deps,
            schema: MessageSchema::new(events::PAYMENT_SUCCEEDED)
                .field("orderId", FieldKind::String)
                .field("transactionId", FieldKind::String)
                .optional_field("amount", FieldKind::Number)
                .optional_field("currency", FieldKind::String),
        }
    }
}

#[async_trait]
impl EventHandler for PaymentSucceededHandler {
    fn name(&self) -> &'static str {
        "order-payment-succeeded"
    }

    fn schema(&self) -> &MessageSchema {
        &self.schema
    }

    async fn handle(
        &self,
        payload: &serde_json::Value,
        metadata: &DeliveryMetadata,
    ) -> Result<HandlerOutcome, HandlerError> {
        let payload: PaymentSucceededPayload = parse(payload)?;
        let order_id = parse_order_id(&payload.order_id)?;

        let Some(order) = self.deps.load(order_id).await? else {
            warn!(order_id = %order_id, "Payment success for unknown order, acknowledging");
            return Ok(HandlerOutcome::NoopStale);
        };

        match saga::apply(order.status, SagaTrigger::PaymentSucceeded) {
            Ok(next) => {
                let confirms: Vec<NewOutboxEvent> = order
                    .reserved_items()
                    .map(|item| NewOutboxEvent {
                        event_id: Uuid::new_v4(),
                        event_type: events::ORDER_CONFIRM.to_string(),
                        payload: serde_json::json!({
                            "orderId": order.id,
                            "productId": item.product_id,
                            "quantity": item.quantity,
                        }),
                        correlation_id: metadata.correlation_id.clone(),
                        routing_key: None,
                    })
                    .collect();

                self.deps
                    .commit_transition(&order, next, None, None, confirms)
                    .await?;
                info!(
                    order_id = %order.id,
                    transaction_id = %payload.transaction_id,
                    "Order paid"
                );
                Ok(HandlerOutcome::Applied)
            }
            Err(TransitionError::AlreadyInTarget { .. }) => Ok(HandlerOutcome::NoopAlreadyApplied),
            Err(TransitionError::Stale { .. }) => Ok(HandlerOutcome::NoopStale),
            Err(illegal @ TransitionError::Illegal { .. }) => {
                Err(HandlerError::Permanent(illegal.to_string()))
            }
        }
    }
}

//
// ===== payment.failed =====
//

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentFailedPayload {
    order_id: String,
    #[serde(default)]
    reason: Option<String>,
}

/// CONFIRMED → CANCELLED on payment failure, releasing every reserved line
/// first.
pub struct PaymentFailedHandler {
    deps: SagaDeps,
    schema: MessageSchema,
}

impl PaymentFailedHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(deps: SagaDeps) -> Self {
        Self {
            deps,
            schema: MessageSchema::new(events::PAYMENT_FAILED)
                .field("orderId", FieldKind::String)
                .optional_field("reason", FieldKind::String)
                .optional_field("products", FieldKind::Array),
        }
    }
}

#[async_trait]
impl EventHandler for PaymentFailedHandler {
    fn name(&self) -> &'static str {
        "order-payment-failed"
    }

    fn schema(&self) -> &MessageSchema {
        &self.schema
    }

    async fn handle(
        &self,
        payload: &serde_json::Value,
        metadata: &DeliveryMetadata,
    ) -> Result<HandlerOutcome, HandlerError> {
        let payload: PaymentFailedPayload = parse(payload)?;
        let order_id = parse_order_id(&payload.order_id)?;

        let Some(order) = self.deps.load(order_id).await? else {
            warn!(order_id = %order_id, "Payment failure for unknown order, acknowledging");
            return Ok(HandlerOutcome::NoopStale);
        };

        match saga::apply(order.status, SagaTrigger::PaymentFailed) {
            Ok(next) => {
                let reason = format!(
                    "payment failed: {}",
                    payload.reason.as_deref().unwrap_or("unspecified")
                );

                // Releases first, then the cancellation notice, all in the
                // same transaction as the status write.
                let mut follow_ons =
                    SagaDeps::compensation_events(&order, &reason, &metadata.correlation_id);
                follow_ons.push(SagaDeps::cancelled_event(
                    &order,
                    &reason,
                    &metadata.correlation_id,
                ));

                // Compensated lines are no longer reserved.
                let mut items = order.items.clone();
                for item in &mut items {
                    item.reserved = false;
                }

                self.deps
                    .commit_transition(&order, next, Some(&reason), Some(&items), follow_ons)
                    .await?;
                info!(order_id = %order.id, reason, "Order cancelled after payment failure");
                Ok(HandlerOutcome::Applied)
            }
            Err(TransitionError::AlreadyInTarget { .. }) => Ok(HandlerOutcome::NoopAlreadyApplied),
            Err(TransitionError::Stale { .. }) => Ok(HandlerOutcome::NoopStale),
            Err(illegal @ TransitionError::Illegal { .. }) => {
                Err(HandlerError::Permanent(illegal.to_string()))
            }
        }
    }
}

//
// ===== seckill.order.won =====
//

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeckillWonPayload {
    user_id: String,
    product_id: String,
    /// Unit price in cents, snapshotted from the campaign.
    price: i64,
    quantity: i64,
    #[serde(default)]
    metadata: Option<SeckillWonMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeckillWonMetadata {
    #[serde(default)]
    reservation_id: Option<String>,
}

/// Materialises a flash-sale win as a PENDING order with
/// `metadata.source = seckill`, entering the ordinary saga.
pub struct SeckillWonHandler {
    deps: SagaDeps,
    schema: MessageSchema,
}

impl SeckillWonHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(deps: SagaDeps) -> Self {
        Self {
            deps,
            schema: MessageSchema::new(events::SECKILL_ORDER_WON)
                .field("userId", FieldKind::String)
                .field("productId", FieldKind::String)
                .field("price", FieldKind::Number)
                .field("quantity", FieldKind::Number)
                .optional_field("metadata", FieldKind::Object),
        }
    }
}

#[async_trait]
impl EventHandler for SeckillWonHandler {
    fn name(&self) -> &'static str {
        "order-seckill-won"
    }

    fn schema(&self) -> &MessageSchema {
        &self.schema
    }

    async fn handle(
        &self,
        payload: &serde_json::Value,
        metadata: &DeliveryMetadata,
    ) -> Result<HandlerOutcome, HandlerError> {
        let payload: SeckillWonPayload = parse(payload)?;
        if payload.quantity <= 0 {
            return Err(HandlerError::Permanent(format!(
                "non-positive quantity {}",
                payload.quantity
            )));
        }

        let seckill_ref = payload
            .metadata
            .as_ref()
            .and_then(|m| m.reservation_id.clone())
            .unwrap_or_else(|| metadata.event_id.to_string());

        let item = OrderItem {
            product_id: payload.product_id.clone(),
            name: payload.product_id.clone(),
            unit_price_cents: payload.price,
            quantity: payload.quantity,
            reserved: false,
        };
        let order = Order {
            id: Uuid::new_v4(),
            user_id: payload.user_id.clone(),
            total_price_cents: item.line_total_cents(),
            items: vec![item],
            status: OrderStatus::Pending,
            cancellation_reason: None,
            metadata: OrderMetadata {
                source: OrderSource::Seckill,
                seckill_ref: Some(seckill_ref.clone()),
                correlation_id: Some(metadata.correlation_id.clone()),
            },
            created_at: chrono::Utc::now(),
        };

        let created = NewOutboxEvent {
            event_id: Uuid::new_v4(),
            event_type: events::ORDER_CREATED.to_string(),
            payload: serde_json::json!({
                "orderId": order.id,
                "products": [{
                    "productId": payload.product_id,
                    "quantity": payload.quantity,
                }],
                "metadata": {
                    "source": "seckill",
                    "seckillRef": seckill_ref,
                },
            }),
            correlation_id: metadata.correlation_id.clone(),
            routing_key: None,
        };

        let mut tx = self
            .deps
            .store
            .pool()
            .begin()
            .await
            .map_err(HandlerError::transient)?;
        self.deps
            .store
            .insert(&mut tx, &order)
            .await
            .map_err(classify_store)?;
        self.deps
            .outbox
            .enqueue(&mut tx, created)
            .await
            .map_err(HandlerError::transient)?;
        tx.commit().await.map_err(HandlerError::transient)?;

        info!(
            order_id = %order.id,
            user_id = %payload.user_id,
            product_id = %payload.product_id,
            "Flash-sale order created"
        );
        metrics::counter!("order.seckill_orders").increment(1);
        Ok(HandlerOutcome::Applied)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reserved_success_payload_parses() {
        let payload: ReservedSuccessPayload = parse(&json!({
            "orderId": "5f6c0f23-0b2e-4b5e-9af5-2d5e86f0a111",
            "products": [{"productId": "p-1", "quantity": 2}],
        }))
        .unwrap();
        assert_eq!(payload.products[0].quantity, 2);
    }

    #[test]
    fn bad_order_id_is_permanent() {
        assert!(matches!(
            parse_order_id("not-a-uuid"),
            Err(HandlerError::Permanent(_))
        ));
    }

    #[test]
    fn seckill_payload_defaults() {
        let payload: SeckillWonPayload = parse(&json!({
            "userId": "u-1",
            "productId": "p-9",
            "price": 1999,
            "quantity": 1,
            "metadata": {"source": "seckill", "reservationId": "r-1"},
        }))
        .unwrap();
        assert_eq!(
            payload.metadata.unwrap().reservation_id.as_deref(),
            Some("r-1")
        );
    }

    #[test]
    fn compensation_routes_by_source() {
        let base = Order {
            id: Uuid::new_v4(),
            user_id: "u-1".into(),
            items: vec![OrderItem {
                product_id: "p-1".into(),
                name: "P-1".into(),
                unit_price_cents: 500,
                quantity: 2,
                reserved: true,
            }],
            total_price_cents: 1000,
            status: OrderStatus::Confirmed,
            cancellation_reason: None,
            metadata: OrderMetadata::default(),
            created_at: chrono::Utc::now(),
        };

        let events_regular = SagaDeps::compensation_events(&base, "payment failed", "corr");
        assert_eq!(events_regular.len(), 1);
        assert_eq!(events_regular[0].event_type, events::ORDER_RELEASE);

        let seckill = Order {
            metadata: OrderMetadata {
                source: OrderSource::Seckill,
                seckill_ref: Some("r-1".into()),
                correlation_id: None,
            },
            ..base
        };
        let events_seckill = SagaDeps::compensation_events(&seckill, "payment failed", "corr");
        assert_eq!(events_seckill.len(), 1);
        assert_eq!(events_seckill[0].event_type, events::SECKILL_RELEASE);
        assert_eq!(events_seckill[0].payload["userId"], "u-1");
    }

    #[test]
    fn unreserved_lines_are_not_compensated() {
        let order = Order {
            id: Uuid::new_v4(),
            user_id: "u-1".into(),
            items: vec![
                OrderItem {
                    product_id: "a".into(),
                    name: "A".into(),
                    unit_price_cents: 100,
                    quantity: 1,
                    reserved: true,
                },
                OrderItem {
                    product_id: "b".into(),
                    name: "B".into(),
                    unit_price_cents: 100,
                    quantity: 1,
                    reserved: false,
                },
            ],
            total_price_cents: 200,
            status: OrderStatus::Confirmed,
            cancellation_reason: None,
            metadata: OrderMetadata::default(),
            created_at: chrono::Utc::now(),
        };

        let events = SagaDeps::compensation_events(&order, "payment failed", "corr");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["productId"], "a");
    }
}
