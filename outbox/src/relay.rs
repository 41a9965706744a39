//! Change-feed relay: publishes committed outbox events to the broker.
//!
//! The relay listens on the `souk_outbox` Postgres channel (an `AFTER
//! INSERT` trigger notifies with the new row's sequence), persists the
//! sequence as its resume token immediately on receipt, then loads and
//! publishes the event. A sweep of overdue PENDING rows runs at startup and
//! after every reconnect, so events stranded across downtime or a publish
//! failure window are never lost.
//!
//! # Pattern: listen-publish-reconnect loop
//!
//! ```text
//! loop {
//!     sweep overdue PENDING
//!     listen on change feed:
//!         loop {
//!             notification -> save cursor -> load event -> publish
//!             shutdown signal -> exit
//!         }
//!     if feed lost: wait 5s and retry
//! }
//! ```
//!
//! Ordering between events of different aggregates is not guaranteed;
//! events inserted by one transaction notify in insertion order.

use crate::store::{retry_delay, OutboxEvent, OutboxStatus, OutboxStore, MAX_RETRIES};
use souk_core::bus::EventPublisher;
use souk_core::envelope::{DeliveryMetadata, EventEnvelope};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Outcome of a single publish attempt.
enum Attempt {
    /// Broker acknowledged; the event is PUBLISHED.
    Published,
    /// The event was parked as FAILED (budget exhausted or unserializable).
    Parked,
    /// Transient failure; try again after the backoff.
    RetryAfter(Duration),
}

/// Long-running publisher for one service's outbox.
#[derive(Clone)]
pub struct OutboxRelay {
    store: OutboxStore,
    publisher: Arc<dyn EventPublisher>,
    shutdown: broadcast::Sender<()>,
    reconnect_delay: Duration,
    sweep_interval: Duration,
}

impl OutboxRelay {
    /// Create a relay over the service's outbox store.
    #[must_use]
    pub fn new(
        store: OutboxStore,
        publisher: Arc<dyn EventPublisher>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            store,
            publisher,
            shutdown,
            reconnect_delay: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(30),
        }
    }

    /// Override the reconnect backoff (default 5 s).
    #[must_use]
    pub const fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Spawn the relay as a background task.
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Run the listen-publish-reconnect loop until shutdown.
    async fn run(&self) {
        info!("Outbox relay started");
        let mut shutdown = self.shutdown.subscribe();

        loop {
            // Sweep first: anything that became due while we were away (or
            // before we ever ran) is published before the feed reopens.
            self.sweep_due().await;

            match sqlx::postgres::PgListener::connect_with(self.store.pool()).await {
                Ok(mut listener) => {
                    if let Err(e) = listener.listen("souk_outbox").await {
                        error!(error = %e, "Failed to LISTEN on outbox channel");
                    } else {
                        info!("Outbox relay listening on change feed");
                        if self.pump(&mut listener, &mut shutdown).await {
                            break; // shutdown requested
                        }
                        warn!(
                            "Outbox change feed lost, reconnecting in {:?}",
                            self.reconnect_delay
                        );
                    }
                }
                Err(e) => {
                    error!(
                        error = %e,
                        "Failed to open outbox change feed, retrying in {:?}",
                        self.reconnect_delay
                    );
                }
            }

            tokio::select! {
                _ = shutdown.recv() => break,
                () = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }

        info!("Outbox relay stopped");
    }

    /// Forward notifications until the stream errors (returns `false`) or a
    /// shutdown signal arrives (returns `true`).
    async fn pump(
        &self,
        listener: &mut sqlx::postgres::PgListener,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> bool {
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Outbox relay received shutdown signal");
                    return true;
                }
                _ = sweep.tick() => {
                    self.sweep_due().await;
                }
                notification = listener.recv() => {
                    match notification {
                        Ok(notification) => {
                            let Ok(seq) = notification.payload().parse::<i64>() else {
                                warn!(payload = notification.payload(), "Ignoring malformed outbox notification");
                                continue;
                            };
                            self.on_notification(seq).await;
                        }
                        Err(e) => {
                            error!(error = %e, "Outbox change feed error");
                            return false;
                        }
                    }
                }
            }
        }
    }

    /// Handle one change-feed notification.
    async fn on_notification(&self, seq: i64) {
        // Persist the resume token before acting: a crash here replays at
        // most the event we have not published yet.
        if let Err(e) = self.store.save_cursor(seq).await {
            warn!(seq, error = %e, "Failed to persist relay cursor");
        }

        match self.store.fetch_by_seq(seq).await {
            Ok(Some(event)) if event.status == OutboxStatus::Pending => {
                self.dispatch(event).await;
            }
            Ok(Some(_)) => {
                // Already handled by the sweep or a prior incarnation.
                debug!(seq, "Notification for non-pending event, skipping");
            }
            Ok(None) => warn!(seq, "Notification for unknown outbox row"),
            Err(e) => error!(seq, error = %e, "Failed to load notified outbox event"),
        }
    }

    /// Publish every overdue PENDING event, oldest first.
    async fn sweep_due(&self) {
        match self.store.due_pending(256).await {
            Ok(events) => {
                if !events.is_empty() {
                    info!(count = events.len(), "Sweeping overdue outbox events");
                }
                for event in events {
                    self.dispatch(event).await;
                }
            }
            Err(e) => error!(error = %e, "Outbox sweep query failed"),
        }

        if let Ok((pending, age)) = self.store.pending_stats().await {
            #[allow(clippy::cast_precision_loss)]
            {
                metrics::gauge!("outbox.pending").set(pending as f64);
                metrics::gauge!("outbox.oldest_pending_age_seconds").set(age as f64);
            }
        }
    }

    /// Attempt once; on a transient failure hand the event to a background
    /// retry task so the feed keeps draining.
    async fn dispatch(&self, event: OutboxEvent) {
        match self.attempt(&event).await {
            Attempt::Published | Attempt::Parked => {}
            Attempt::RetryAfter(delay) => {
                let relay = self.clone();
                let event_id = event.event_id;
                tokio::spawn(async move {
                    let mut delay = delay;
                    loop {
                        tokio::time::sleep(delay).await;
                        // Re-read: the sweep (or an operator) may have
                        // resolved the event meanwhile.
                        let event = match relay.store.fetch(event_id).await {
                            Ok(Some(event)) if event.status == OutboxStatus::Pending => event,
                            Ok(_) => return,
                            Err(e) => {
                                error!(event_id = %event_id, error = %e, "Retry re-read failed");
                                return;
                            }
                        };
                        match relay.attempt(&event).await {
                            Attempt::Published | Attempt::Parked => return,
                            Attempt::RetryAfter(next) => delay = next,
                        }
                    }
                });
            }
        }
    }

    /// One publish attempt with full bookkeeping.
    async fn attempt(&self, event: &OutboxEvent) -> Attempt {
        let envelope = EventEnvelope {
            event_type: event.event_type.clone(),
            data: event.payload.clone(),
            timestamp: event.created_at,
        };
        let metadata = DeliveryMetadata {
            event_id: event.event_id,
            correlation_id: event.correlation_id.clone(),
            timestamp: event.created_at,
            headers: HashMap::new(),
        };

        match self
            .publisher
            .publish(event.queue(), &envelope, &metadata)
            .await
        {
            Ok(()) => {
                debug!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    queue = event.queue(),
                    "Outbox event published"
                );
                if let Err(e) = self.store.mark_published(event.event_id).await {
                    // The broker has the event; worst case it is republished
                    // and deduplicated downstream.
                    warn!(event_id = %event.event_id, error = %e, "Failed to mark event published");
                }
                Attempt::Published
            }
            Err(bus_err) if !bus_err.is_transient() => {
                if let Err(e) = self
                    .store
                    .mark_failed(event.event_id, &bus_err.to_string())
                    .await
                {
                    error!(event_id = %event.event_id, error = %e, "Failed to park malformed event");
                }
                Attempt::Parked
            }
            Err(bus_err) => {
                let retries = match self
                    .store
                    .record_failure(event.event_id, &bus_err.to_string())
                    .await
                {
                    Ok(retries) => retries,
                    Err(e) => {
                        error!(event_id = %event.event_id, error = %e, "Failed to record publish failure");
                        return Attempt::Parked;
                    }
                };

                if retries >= MAX_RETRIES {
                    let reason = format!("retry budget exhausted: {bus_err}");
                    if let Err(e) = self.store.mark_failed(event.event_id, &reason).await {
                        error!(event_id = %event.event_id, error = %e, "Failed to park exhausted event");
                    }
                    Attempt::Parked
                } else {
                    let delay = retry_delay(retries)
                        .to_std()
                        .unwrap_or(Duration::from_secs(1));
                    Attempt::RetryAfter(delay)
                }
            }
        }
    }
}
