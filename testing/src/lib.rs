//! In-memory mocks for testing souk services without infrastructure.
//!
//! Handler logic is where the saga's correctness lives, so it must be
//! testable without Postgres, Redis, or a broker. This crate provides:
//!
//! - [`InMemoryBus`]: an [`EventPublisher`] that records every publish and
//!   can be told to fail (for ghost-order and outbox-retry paths),
//! - [`InMemoryProcessedStore`]: a [`ProcessedStore`] over a `HashSet`.
//!
//! # Example
//!
//! ```
//! use souk_testing::InMemoryBus;
//! use souk_core::envelope::{DeliveryMetadata, EventEnvelope};
//! use souk_core::bus::EventPublisher;
//! use serde_json::json;
//!
//! # async fn example() {
//! let bus = InMemoryBus::new();
//! let envelope = EventEnvelope::new("order.created", json!({"orderId": "o-1"}));
//! let metadata = DeliveryMetadata::originate("corr-1");
//! bus.publish("order.created", &envelope, &metadata).await.unwrap();
//!
//! assert_eq!(bus.published().await.len(), 1);
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::unwrap_used, clippy::expect_used)] // test-support crate

use async_trait::async_trait;
use souk_core::bus::{BusError, EventPublisher, ProcessedStore};
use souk_core::envelope::{DeliveryMetadata, EventEnvelope};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// One recorded publish.
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    /// Destination queue.
    pub queue: String,
    /// The envelope as published.
    pub envelope: EventEnvelope,
    /// The metadata as published.
    pub metadata: DeliveryMetadata,
}

/// In-memory [`EventPublisher`] that records everything.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    published: Arc<Mutex<Vec<PublishedEvent>>>,
    fail_publishes: Arc<Mutex<bool>>,
}

impl InMemoryBus {
    /// Empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far, in order.
    pub async fn published(&self) -> Vec<PublishedEvent> {
        self.published.lock().await.clone()
    }

    /// Publishes to `queue` so far, in order.
    pub async fn published_to(&self, queue: &str) -> Vec<PublishedEvent> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|event| event.queue == queue)
            .cloned()
            .collect()
    }

    /// Make subsequent publishes fail with a transient error (and back).
    pub async fn set_failing(&self, failing: bool) {
        *self.fail_publishes.lock().await = failing;
    }

    /// Drop everything recorded.
    pub async fn clear(&self) {
        self.published.lock().await.clear();
    }
}

#[async_trait]
impl EventPublisher for InMemoryBus {
    async fn publish(
        &self,
        queue: &str,
        envelope: &EventEnvelope,
        metadata: &DeliveryMetadata,
    ) -> Result<(), BusError> {
        if *self.fail_publishes.lock().await {
            return Err(BusError::PublishFailed {
                queue: queue.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        self.published.lock().await.push(PublishedEvent {
            queue: queue.to_string(),
            envelope: envelope.clone(),
            metadata: metadata.clone(),
        });
        Ok(())
    }
}

/// In-memory [`ProcessedStore`].
#[derive(Clone, Default)]
pub struct InMemoryProcessedStore {
    markers: Arc<Mutex<HashMap<String, String>>>,
    fail: Arc<Mutex<bool>>,
}

impl InMemoryProcessedStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent operations fail (marker store outage).
    pub async fn set_failing(&self, failing: bool) {
        *self.fail.lock().await = failing;
    }

    /// All marked event ids.
    pub async fn marked(&self) -> HashSet<String> {
        self.markers.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl ProcessedStore for InMemoryProcessedStore {
    async fn is_processed(&self, event_id: &str) -> Result<bool, BusError> {
        if *self.fail.lock().await {
            return Err(BusError::MarkerStore("injected outage".to_string()));
        }
        Ok(self.markers.lock().await.contains_key(event_id))
    }

    async fn mark_processed(&self, event_id: &str, handler: &str) -> Result<(), BusError> {
        if *self.fail.lock().await {
            return Err(BusError::MarkerStore("injected outage".to_string()));
        }
        // Write-once: an existing marker is never overwritten.
        self.markers
            .lock()
            .await
            .entry(event_id.to_string())
            .or_insert_with(|| handler.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn bus_records_in_order() {
        let bus = InMemoryBus::new();
        for i in 0..3 {
            let envelope = EventEnvelope::new("order.created", json!({"i": i}));
            bus.publish("order.created", &envelope, &DeliveryMetadata::originate("c"))
                .await
                .unwrap();
        }
        let published = bus.published().await;
        assert_eq!(published.len(), 3);
        assert_eq!(published[2].envelope.data["i"], 2);
    }

    #[tokio::test]
    async fn bus_failure_injection() {
        let bus = InMemoryBus::new();
        bus.set_failing(true).await;
        let envelope = EventEnvelope::new("seckill.order.won", json!({}));
        let result = bus
            .publish("seckill.order.won", &envelope, &DeliveryMetadata::originate("c"))
            .await;
        assert!(result.is_err());
        assert!(bus.published().await.is_empty());
    }

    #[tokio::test]
    async fn markers_are_write_once() {
        let store = InMemoryProcessedStore::new();
        assert!(!store.is_processed("e-1").await.unwrap());
        store.mark_processed("e-1", "first").await.unwrap();
        store.mark_processed("e-1", "second").await.unwrap();
        assert!(store.is_processed("e-1").await.unwrap());
        assert_eq!(
            store.markers.lock().await.get("e-1").map(String::as_str),
            Some("first")
        );
    }
}
