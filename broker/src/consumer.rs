//! Four-layer consumer pipeline.
//!
//! Every delivery passes through, in order:
//!
//! 1. **Trace extraction**: the producer's W3C context is pulled from the
//!    message headers and a child span named after the event type wraps the
//!    rest of the pipeline.
//! 2. **Idempotency**: if `processed:{eventId}` exists in the marker
//!    store, the delivery is acknowledged and dropped.
//! 3. **Schema validation**: the payload is checked against the handler's
//!    declarative schema; violations negative-acknowledge without requeue,
//!    routing the message to `{queue}.dlq`.
//! 4. **Handler invocation**: the validated payload plus the delivery
//!    metadata (event id, correlation id, timestamp, headers).
//!
//! On success the marker is set with a 24-hour expiry and the delivery is
//! acknowledged. On failure the error class decides: transient errors
//! requeue, permanent errors go to the DLQ.
//!
//! The consumer itself runs a subscribe-process-reconnect loop: if the
//! channel drops it reopens after a delay, and a shutdown signal drains the
//! in-flight delivery before exiting.

use crate::AmqpBroker;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions};
use lapin::types::{AMQPValue, FieldTable};
use souk_core::bus::ProcessedStore;
use souk_core::envelope::{DeliveryMetadata, EventEnvelope};
use souk_core::error::{HandlerError, HandlerOutcome};
use souk_core::schema::MessageSchema;
use souk_runtime::trace::consumer_span;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// A consumer-side event handler.
///
/// Handlers are invoked below the idempotency and schema layers, so they
/// may assume the payload satisfies [`EventHandler::schema`] and that this
/// event id was never successfully handled before. They must still be
/// order-tolerant: deliveries across queues are not ordered.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Handler name, used in logs and as the marker value.
    fn name(&self) -> &'static str;

    /// The payload contract this handler requires.
    fn schema(&self) -> &MessageSchema;

    /// Process one validated delivery.
    ///
    /// # Errors
    ///
    /// [`HandlerError::Transient`] to requeue, [`HandlerError::Permanent`]
    /// to dead-letter.
    async fn handle(
        &self,
        payload: &serde_json::Value,
        metadata: &DeliveryMetadata,
    ) -> Result<HandlerOutcome, HandlerError>;
}

/// How the pipeline terminated a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Positive acknowledgement.
    Ack,
    /// Negative acknowledgement with requeue.
    Requeue,
    /// Negative acknowledgement without requeue (dead-letter).
    DeadLetter,
}

/// One queue's consumer: pipeline + reconnect loop.
pub struct QueueConsumer {
    broker: Arc<AmqpBroker>,
    queue: String,
    handler: Arc<dyn EventHandler>,
    processed: Arc<dyn ProcessedStore>,
    shutdown: broadcast::Sender<()>,
    retry_delay: Duration,
}

impl QueueConsumer {
    /// Create a consumer for `queue`.
    #[must_use]
    pub fn new(
        broker: Arc<AmqpBroker>,
        queue: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        processed: Arc<dyn ProcessedStore>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            broker,
            queue: queue.into(),
            handler,
            processed,
            shutdown,
            retry_delay: Duration::from_secs(5),
        }
    }

    /// Override the reconnect delay (default 5 s).
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Spawn the consumer as a background task.
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        info!(queue = %self.queue, handler = self.handler.name(), "Consumer started");
        let mut shutdown = self.shutdown.subscribe();

        loop {
            match self.consume_until_error(&mut shutdown).await {
                Ok(()) => break, // shutdown
                Err(e) => {
                    error!(
                        queue = %self.queue,
                        error = %e,
                        "Consumer channel lost, reopening in {:?}",
                        self.retry_delay
                    );
                }
            }

            tokio::select! {
                _ = shutdown.recv() => break,
                () = tokio::time::sleep(self.retry_delay) => {}
            }
        }

        info!(queue = %self.queue, "Consumer stopped");
    }

    /// Subscribe and process deliveries until shutdown (`Ok`) or a channel
    /// error (`Err`).
    async fn consume_until_error(
        &self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), String> {
        let channel = self
            .broker
            .create_channel()
            .await
            .map_err(|e| e.to_string())?;
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| e.to_string())?;
        AmqpBroker::declare_topology(&channel, &self.queue)
            .await
            .map_err(|e| e.to_string())?;

        let consumer_tag = format!("{}-{}", self.handler.name(), Uuid::new_v4().simple());
        let mut deliveries = channel
            .basic_consume(
                &self.queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| e.to_string())?;

        info!(queue = %self.queue, consumer_tag, "Subscribed with prefetch 1");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(queue = %self.queue, "Consumer received shutdown signal");
                    return Ok(());
                }
                delivery = deliveries.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            // The pipeline never crashes the loop: every
                            // delivery terminates in ack or nack.
                            self.process_delivery(delivery).await;
                        }
                        Some(Err(e)) => return Err(e.to_string()),
                        None => return Err("delivery stream ended".to_string()),
                    }
                }
            }
        }
    }

    /// Run one delivery through the four layers.
    async fn process_delivery(&self, delivery: Delivery) {
        // Parse the envelope first: an unparseable body can never succeed
        // and goes straight to the DLQ.
        let envelope: EventEnvelope = match serde_json::from_slice(&delivery.data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(queue = %self.queue, error = %e, "Malformed envelope, dead-lettering");
                self.finish(&delivery, Termination::DeadLetter).await;
                return;
            }
        };

        let metadata = delivery_metadata(&delivery, &envelope);

        // Layer 1: child span from the propagated trace context.
        let span = consumer_span(&envelope.event_type, &metadata.headers);
        self.process_in_span(&delivery, &envelope, &metadata)
            .instrument(span)
            .await;
    }

    async fn process_in_span(
        &self,
        delivery: &Delivery,
        envelope: &EventEnvelope,
        metadata: &DeliveryMetadata,
    ) {
        let event_id = metadata.event_id.to_string();

        // Layer 2: idempotency.
        match self.processed.is_processed(&event_id).await {
            Ok(true) => {
                debug!(event_id, "Duplicate delivery, acknowledging");
                metrics::counter!("broker.duplicates", "queue" => self.queue.clone())
                    .increment(1);
                self.finish(delivery, Termination::Ack).await;
                return;
            }
            Ok(false) => {}
            Err(e) => {
                // Without the marker store we cannot prove novelty; requeue
                // and try again when it is back.
                warn!(event_id, error = %e, "Marker store unavailable, requeueing");
                self.finish(delivery, Termination::Requeue).await;
                return;
            }
        }

        // Layer 3: schema validation.
        let violations = self.handler.schema().validate(&envelope.data);
        if !violations.is_empty() {
            let rendered: Vec<String> = violations.iter().map(ToString::to_string).collect();
            warn!(
                event_id,
                event_type = %envelope.event_type,
                violations = ?rendered,
                "Schema validation failed, dead-lettering"
            );
            metrics::counter!("broker.dead_lettered", "queue" => self.queue.clone())
                .increment(1);
            self.finish(delivery, Termination::DeadLetter).await;
            return;
        }

        // Layer 4: the handler.
        match self.handler.handle(&envelope.data, metadata).await {
            Ok(outcome) => {
                if outcome == HandlerOutcome::NoopStale {
                    warn!(
                        event_id,
                        event_type = %envelope.event_type,
                        "Stale delivery acknowledged as no-op"
                    );
                }
                if let Err(e) = self
                    .processed
                    .mark_processed(&event_id, self.handler.name())
                    .await
                {
                    // The delivery still acks; a redelivery would be caught
                    // by the handler's own idempotency.
                    warn!(event_id, error = %e, "Failed to set processed marker");
                }
                metrics::counter!("broker.processed", "queue" => self.queue.clone())
                    .increment(1);
                self.finish(delivery, Termination::Ack).await;
            }
            Err(HandlerError::Transient(reason)) => {
                warn!(
                    event_id,
                    event_type = %envelope.event_type,
                    reason,
                    "Transient handler failure, requeueing"
                );
                metrics::counter!("broker.requeued", "queue" => self.queue.clone())
                    .increment(1);
                self.finish(delivery, Termination::Requeue).await;
            }
            Err(HandlerError::Permanent(reason)) => {
                error!(
                    event_id,
                    event_type = %envelope.event_type,
                    reason,
                    "Permanent handler failure, dead-lettering"
                );
                metrics::counter!("broker.dead_lettered", "queue" => self.queue.clone())
                    .increment(1);
                self.finish(delivery, Termination::DeadLetter).await;
            }
        }
    }

    async fn finish(&self, delivery: &Delivery, termination: Termination) {
        let result = match termination {
            Termination::Ack => delivery.ack(BasicAckOptions::default()).await,
            Termination::Requeue => {
                delivery
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..BasicNackOptions::default()
                    })
                    .await
            }
            Termination::DeadLetter => {
                delivery
                    .nack(BasicNackOptions {
                        requeue: false,
                        ..BasicNackOptions::default()
                    })
                    .await
            }
        };
        if let Err(e) = result {
            // The broker will redeliver the unacked message; downstream
            // idempotency absorbs it.
            error!(queue = %self.queue, error = %e, "Failed to settle delivery");
        }
    }
}

/// Assemble delivery metadata from the AMQP properties and headers.
fn delivery_metadata(delivery: &Delivery, envelope: &EventEnvelope) -> DeliveryMetadata {
    let event_id = delivery
        .properties
        .message_id()
        .as_ref()
        .and_then(|id| Uuid::parse_str(id.as_str()).ok())
        .unwrap_or_else(|| {
            warn!("Delivery without a message id, minting one (dedup disabled for it)");
            Uuid::new_v4()
        });

    let correlation_id = delivery
        .properties
        .correlation_id()
        .as_ref()
        .map_or_else(|| event_id.to_string(), |id| id.as_str().to_string());

    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(header_map)
        .unwrap_or_default();

    DeliveryMetadata {
        event_id,
        correlation_id,
        timestamp: envelope.timestamp,
        headers,
    }
}

/// String-valued view of an AMQP header table.
fn header_map(table: &FieldTable) -> HashMap<String, String> {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| match value {
            AMQPValue::LongString(s) => Some((key.to_string(), s.to_string())),
            AMQPValue::ShortString(s) => Some((key.to_string(), s.to_string())),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_map_keeps_string_values_only() {
        let mut table = FieldTable::default();
        table.insert(
            "traceparent".into(),
            AMQPValue::LongString("00-abc-def-01".into()),
        );
        table.insert("x-retries".into(), AMQPValue::LongInt(3));

        let map = header_map(&table);
        assert_eq!(map.get("traceparent").map(String::as_str), Some("00-abc-def-01"));
        assert!(!map.contains_key("x-retries"));
    }
}
