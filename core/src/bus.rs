//! Infrastructure seams: publishing and idempotency markers.
//!
//! Services and the outbox relay talk to the broker through
//! [`EventPublisher`], and the consumer pipeline checks duplicates through
//! [`ProcessedStore`]. The `souk-broker` crate provides the AMQP/Redis
//! implementations; `souk-testing` provides in-memory ones so handler logic
//! tests run without any infrastructure.

use crate::envelope::{DeliveryMetadata, EventEnvelope};
use async_trait::async_trait;
use thiserror::Error;

/// Errors from bus operations.
#[derive(Error, Debug)]
pub enum BusError {
    /// Could not reach or stay connected to the broker.
    #[error("broker connection failed: {0}")]
    ConnectionFailed(String),

    /// A publish did not get acknowledged.
    #[error("publish to `{queue}` failed: {reason}")]
    PublishFailed {
        /// Destination queue.
        queue: String,
        /// Broker-reported reason.
        reason: String,
    },

    /// The envelope could not be serialized. Deterministic: retrying the
    /// same envelope cannot succeed.
    #[error("failed to serialize envelope: {0}")]
    Serialization(String),

    /// The marker store was unreachable.
    #[error("processed-marker store error: {0}")]
    MarkerStore(String),
}

impl BusError {
    /// Whether another attempt might succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !matches!(self, Self::Serialization(_))
    }
}

/// Publishes envelopes to a named queue.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one envelope. The queue (and its dead-letter companion) is
    /// declared before the first send; the event id from `metadata` becomes
    /// the broker message id, the correlation id is copied, and trace
    /// context is injected into the message headers.
    ///
    /// # Errors
    ///
    /// [`BusError::PublishFailed`] after the bounded send retries are
    /// exhausted, [`BusError::Serialization`] for an unserializable
    /// envelope.
    async fn publish(
        &self,
        queue: &str,
        envelope: &EventEnvelope,
        metadata: &DeliveryMetadata,
    ) -> Result<(), BusError>;
}

/// Write-once processed-event markers with a bounded lifetime.
#[async_trait]
pub trait ProcessedStore: Send + Sync {
    /// Whether `event_id` was already handled.
    ///
    /// # Errors
    ///
    /// [`BusError::MarkerStore`] when the store is unreachable.
    async fn is_processed(&self, event_id: &str) -> Result<bool, BusError>;

    /// Record that `event_id` was handled by `handler`. The marker expires
    /// after 24 hours; setting an already-set marker is a no-op.
    ///
    /// # Errors
    ///
    /// [`BusError::MarkerStore`] when the store is unreachable.
    async fn mark_processed(&self, event_id: &str, handler: &str) -> Result<(), BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_errors_are_permanent() {
        assert!(!BusError::Serialization("bad".into()).is_transient());
        assert!(BusError::ConnectionFailed("down".into()).is_transient());
        assert!(
            BusError::PublishFailed {
                queue: "q".into(),
                reason: "channel closed".into()
            }
            .is_transient()
        );
    }
}
