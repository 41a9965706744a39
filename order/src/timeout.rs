//! Order timeout worker.
//!
//! A PENDING order that never hears back from inventory would sit forever
//! and hold any reservation that did land. The worker sweeps PENDING orders
//! older than the configured age, cancels them, and emits `order.timeout`
//! with the order's lines so inventory can release whatever was reserved
//! (lines that never reserved release as no-ops).

use crate::store::{OrderStore, OrderStoreError};
use souk_core::envelope::events;
use souk_core::order::{Order, OrderStatus};
use souk_outbox::{NewOutboxEvent, OutboxStore};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Reason string stamped on timed-out orders.
const TIMEOUT_REASON: &str = "order timed out waiting for reservation";

/// Periodic sweeper for stale PENDING orders.
pub struct OrderTimeoutWorker {
    store: OrderStore,
    outbox: OutboxStore,
    max_age: Duration,
    interval: Duration,
    shutdown: broadcast::Sender<()>,
}

impl OrderTimeoutWorker {
    /// Create the worker.
    #[must_use]
    pub const fn new(
        store: OrderStore,
        outbox: OutboxStore,
        max_age: Duration,
        interval: Duration,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            store,
            outbox,
            max_age,
            interval,
            shutdown,
        }
    }

    /// Spawn the worker as a background task.
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        info!(
            max_age_secs = self.max_age.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Order timeout worker started"
        );
        let mut shutdown = self.shutdown.subscribe();
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Timeout sweep failed");
                    }
                }
            }
        }
        info!("Order timeout worker stopped");
    }

    async fn sweep(&self) -> Result<(), OrderStoreError> {
        let max_age = chrono::Duration::from_std(self.max_age)
            .unwrap_or_else(|_| chrono::Duration::seconds(900));
        let stale = self.store.stale_pending(max_age, 100).await?;
        if stale.is_empty() {
            return Ok(());
        }

        info!(count = stale.len(), "Timing out stale PENDING orders");
        for order in stale {
            if let Err(e) = self.cancel(&order).await {
                // One stuck order must not block the sweep; the next tick
                // retries it.
                warn!(order_id = %order.id, error = %e, "Failed to time out order");
            }
        }
        Ok(())
    }

    async fn cancel(&self, order: &Order) -> Result<(), OrderStoreError> {
        let mut tx = self.store.pool().begin().await?;

        let moved = self
            .store
            .transition(
                &mut tx,
                order.id,
                OrderStatus::Pending,
                OrderStatus::Cancelled,
                Some(TIMEOUT_REASON),
                None,
            )
            .await?;
        if !moved {
            // A saga handler won the race; the order is no longer stale.
            tx.rollback().await?;
            return Ok(());
        }

        let correlation_id = order
            .metadata
            .correlation_id
            .clone()
            .unwrap_or_else(|| order.id.to_string());

        let products: Vec<serde_json::Value> = order
            .items
            .iter()
            .map(|item| {
                serde_json::json!({"productId": item.product_id, "quantity": item.quantity})
            })
            .collect();

        self.outbox
            .enqueue(
                &mut tx,
                NewOutboxEvent {
                    event_id: Uuid::new_v4(),
                    event_type: events::ORDER_TIMEOUT.to_string(),
                    payload: serde_json::json!({
                        "orderId": order.id,
                        "products": products,
                        "reason": TIMEOUT_REASON,
                    }),
                    correlation_id: correlation_id.clone(),
                    routing_key: None,
                },
            )
            .await
            .map_err(|e| OrderStoreError::Database(e.to_string()))?;
        self.outbox
            .enqueue(
                &mut tx,
                NewOutboxEvent {
                    event_id: Uuid::new_v4(),
                    event_type: events::ORDER_CANCELLED.to_string(),
                    payload: serde_json::json!({
                        "orderId": order.id,
                        "reason": TIMEOUT_REASON,
                    }),
                    correlation_id,
                    routing_key: None,
                },
            )
            .await
            .map_err(|e| OrderStoreError::Database(e.to_string()))?;

        tx.commit().await?;
        info!(order_id = %order.id, "Order timed out and cancelled");
        metrics::counter!("order.timeouts").increment(1);
        Ok(())
    }
}
