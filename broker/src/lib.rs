//! AMQP broker wrapper for the souk order fabric.
//!
//! Wraps lapin with the platform's conventions so services never touch raw
//! channels:
//!
//! - **Topology**: for every logical queue `q` a durable queue is declared
//!   with dead-letter routing to a durable companion `q.dlq` (default
//!   exchange, routing key `q.dlq`).
//! - **Publishing**: persistent delivery, the outbox event id as the broker
//!   message id, the correlation id copied into the properties, W3C trace
//!   context injected into the message headers, and up to three send
//!   attempts with linear backoff.
//! - **Consuming**: prefetch 1 and the four-layer pipeline in
//!   [`consumer`]: trace extraction, idempotency, schema validation,
//!   handler dispatch with ack/nack classification.
//!
//! Connection establishment retries five times, five seconds apart, before
//! giving up at startup.
//!
//! # Delivery semantics
//!
//! At-least-once: consumers ack only after the handler finished (or after a
//! recognized no-op), and unacked deliveries are redelivered when a process
//! dies. The `processed:{eventId}` markers in Redis make redelivery
//! harmless.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod consumer;
pub mod processed;

pub use consumer::{EventHandler, QueueConsumer};
pub use processed::RedisProcessedStore;

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use souk_core::bus::{BusError, EventPublisher};
use souk_core::envelope::{DeliveryMetadata, EventEnvelope};
use souk_runtime::trace::inject_trace_headers;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Connection attempts before startup fails.
const CONNECT_ATTEMPTS: u32 = 5;
/// Pause between connection attempts.
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Send attempts per publish.
const PUBLISH_ATTEMPTS: u32 = 3;
/// Linear backoff step between send attempts.
const PUBLISH_BACKOFF_STEP: Duration = Duration::from_millis(200);

/// Dead-letter companion of a queue.
#[must_use]
pub fn dlq_name(queue: &str) -> String {
    format!("{queue}.dlq")
}

/// Shared broker handle: one connection, one confirmed publisher channel.
pub struct AmqpBroker {
    connection: Connection,
    publish_channel: Channel,
    declared: Mutex<HashSet<String>>,
}

impl AmqpBroker {
    /// Connect to the broker, retrying up to five times with a five-second
    /// interval.
    ///
    /// # Errors
    ///
    /// [`BusError::ConnectionFailed`] when every attempt failed.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let mut last_error = String::new();
        for attempt in 1..=CONNECT_ATTEMPTS {
            match Connection::connect(url, ConnectionProperties::default()).await {
                Ok(connection) => {
                    let publish_channel = connection
                        .create_channel()
                        .await
                        .map_err(|e| BusError::ConnectionFailed(e.to_string()))?;
                    // Publisher confirms: a publish is only "done" once the
                    // broker acknowledged it, which is what lets the outbox
                    // relay mark events PUBLISHED safely.
                    publish_channel
                        .confirm_select(ConfirmSelectOptions::default())
                        .await
                        .map_err(|e| BusError::ConnectionFailed(e.to_string()))?;

                    info!(attempt, "Connected to AMQP broker");
                    return Ok(Self {
                        connection,
                        publish_channel,
                        declared: Mutex::new(HashSet::new()),
                    });
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        attempt,
                        max_attempts = CONNECT_ATTEMPTS,
                        error = %last_error,
                        "AMQP connection attempt failed, retrying in {CONNECT_RETRY_DELAY:?}"
                    );
                    if attempt < CONNECT_ATTEMPTS {
                        tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(BusError::ConnectionFailed(format!(
            "gave up after {CONNECT_ATTEMPTS} attempts: {last_error}"
        )))
    }

    /// Open a fresh channel (consumers get one each).
    pub(crate) async fn create_channel(&self) -> Result<Channel, BusError> {
        self.connection
            .create_channel()
            .await
            .map_err(|e| BusError::ConnectionFailed(e.to_string()))
    }

    /// Declare `queue` (durable, dead-lettering to `queue.dlq`) and its
    /// durable DLQ. Idempotent; results are cached per process.
    ///
    /// # Errors
    ///
    /// [`BusError::ConnectionFailed`] when a declaration fails.
    pub async fn ensure_queue(&self, queue: &str) -> Result<(), BusError> {
        {
            let declared = self.declared.lock().await;
            if declared.contains(queue) {
                return Ok(());
            }
        }
        Self::declare_topology(&self.publish_channel, queue).await?;
        self.declared.lock().await.insert(queue.to_string());
        Ok(())
    }

    /// Declare the queue pair on a specific channel.
    pub(crate) async fn declare_topology(channel: &Channel, queue: &str) -> Result<(), BusError> {
        let dlq = dlq_name(queue);

        let mut args = FieldTable::default();
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString("".into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(dlq.clone().into()),
        );

        let durable = QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        };

        channel
            .queue_declare(queue, durable, args)
            .await
            .map_err(|e| BusError::ConnectionFailed(format!("declare `{queue}`: {e}")))?;
        channel
            .queue_declare(&dlq, durable, FieldTable::default())
            .await
            .map_err(|e| BusError::ConnectionFailed(format!("declare `{dlq}`: {e}")))?;

        debug!(queue, dlq = %dlq, "Queue topology declared");
        Ok(())
    }

    /// One raw send with publisher confirm.
    async fn send_once(
        &self,
        queue: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), BusError> {
        let confirm = self
            .publish_channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(|e| BusError::PublishFailed {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?
            .await
            .map_err(|e| BusError::PublishFailed {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        if matches!(confirm, Confirmation::Nack(_)) {
            return Err(BusError::PublishFailed {
                queue: queue.to_string(),
                reason: "broker negative-acknowledged the publish".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for AmqpBroker {
    async fn publish(
        &self,
        queue: &str,
        envelope: &EventEnvelope,
        metadata: &DeliveryMetadata,
    ) -> Result<(), BusError> {
        self.ensure_queue(queue).await?;

        let body = serde_json::to_vec(envelope).map_err(|e| BusError::Serialization(e.to_string()))?;

        let mut headers = FieldTable::default();
        for (key, value) in inject_trace_headers(&tracing::Span::current()) {
            headers.insert(key.into(), AMQPValue::LongString(value.into()));
        }
        for (key, value) in &metadata.headers {
            headers.insert(key.clone().into(), AMQPValue::LongString(value.clone().into()));
        }

        let properties = BasicProperties::default()
            .with_delivery_mode(2) // persistent
            .with_content_type("application/json".into())
            .with_message_id(metadata.event_id.to_string().into())
            .with_correlation_id(metadata.correlation_id.clone().into())
            .with_headers(headers);

        let mut last_error = None;
        for attempt in 1..=PUBLISH_ATTEMPTS {
            match self.send_once(queue, &body, properties.clone()).await {
                Ok(()) => {
                    debug!(
                        queue,
                        event_id = %metadata.event_id,
                        event_type = %envelope.event_type,
                        attempt,
                        "Event published"
                    );
                    metrics::counter!("broker.published", "queue" => queue.to_string())
                        .increment(1);
                    return Ok(());
                }
                Err(e) => {
                    warn!(queue, attempt, error = %e, "Publish attempt failed");
                    last_error = Some(e);
                    if attempt < PUBLISH_ATTEMPTS {
                        tokio::time::sleep(PUBLISH_BACKOFF_STEP * attempt).await;
                    }
                }
            }
        }

        let err = last_error.unwrap_or_else(|| BusError::PublishFailed {
            queue: queue.to_string(),
            reason: "no attempt ran".to_string(),
        });
        error!(queue, error = %err, "Publish failed after {PUBLISH_ATTEMPTS} attempts");
        metrics::counter!("broker.publish_failed", "queue" => queue.to_string()).increment(1);
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dlq_names_follow_the_convention() {
        assert_eq!(dlq_name("order.created"), "order.created.dlq");
        assert_eq!(dlq_name("seckill.order.won"), "seckill.order.won.dlq");
    }

    #[test]
    fn publish_backoff_is_linear() {
        assert_eq!(PUBLISH_BACKOFF_STEP * 1, Duration::from_millis(200));
        assert_eq!(PUBLISH_BACKOFF_STEP * 2, Duration::from_millis(400));
    }
}
