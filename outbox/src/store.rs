//! Outbox event table access.

use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use thiserror::Error;
use uuid::Uuid;

/// Maximum publish retries before an event is parked as FAILED.
pub const MAX_RETRIES: i32 = 5;

/// Errors from outbox operations.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Underlying database failure.
    #[error("outbox database error: {0}")]
    Database(String),

    /// The referenced event does not exist.
    #[error("outbox event {0} not found")]
    EventNotFound(Uuid),

    /// A stored status string was not a known status.
    #[error("invalid outbox status: {0}")]
    InvalidStatus(String),
}

impl From<sqlx::Error> for OutboxError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Publication state of an outbox event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    /// Waiting for the relay (or for its next retry slot).
    Pending,
    /// Acknowledged by the broker.
    Published,
    /// Retry budget exhausted or payload unserializable; visible to
    /// operators until manually retried.
    Failed,
}

impl OutboxStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Published => "PUBLISHED",
            Self::Failed => "FAILED",
        }
    }

    /// Parse the database representation.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::InvalidStatus`] for unknown strings.
    pub fn parse(s: &str) -> Result<Self, OutboxError> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PUBLISHED" => Ok(Self::Published),
            "FAILED" => Ok(Self::Failed),
            other => Err(OutboxError::InvalidStatus(other.to_string())),
        }
    }
}

/// An event row as stored.
#[derive(Debug, Clone)]
pub struct OutboxEvent {
    /// Change-feed position (insertion order per writing process).
    pub seq: i64,
    /// Globally unique event identifier; becomes the broker message id and
    /// the consumer-side idempotency key.
    pub event_id: Uuid,
    /// Event type, e.g. `order.created`.
    pub event_type: String,
    /// JSON payload (the `data` object of the wire envelope).
    pub payload: serde_json::Value,
    /// Correlation identifier of the owning business operation.
    pub correlation_id: String,
    /// Destination queue override; defaults to the event type.
    pub routing_key: Option<String>,
    /// Publication state.
    pub status: OutboxStatus,
    /// Failed publish attempts so far.
    pub retries: i32,
    /// Earliest time of the next attempt.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// When the broker acknowledged the event.
    pub published_at: Option<DateTime<Utc>>,
    /// Last publish error, for operators.
    pub last_error: Option<String>,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
}

impl OutboxEvent {
    /// The queue this event rides on.
    #[must_use]
    pub fn queue(&self) -> &str {
        self.routing_key.as_deref().unwrap_or(&self.event_type)
    }
}

/// A new event to enqueue alongside a business write.
#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    /// Caller-provided event identifier (consumers deduplicate on it).
    pub event_id: Uuid,
    /// Event type.
    pub event_type: String,
    /// JSON payload.
    pub payload: serde_json::Value,
    /// Correlation identifier.
    pub correlation_id: String,
    /// Destination queue override.
    pub routing_key: Option<String>,
}

/// Access to one service's `outbox_events` table.
#[derive(Clone)]
pub struct OutboxStore {
    pool: PgPool,
}

impl OutboxStore {
    /// Create a store over the service's pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The pool this store was built over (the relay shares it for its
    /// LISTEN connection).
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a PENDING event inside the caller's transaction.
    ///
    /// This is the write half of the atomic dual-write: commit makes the
    /// business change and the event visible together, rollback discards
    /// both.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] if the insert fails (including a
    /// duplicate `event_id`).
    pub async fn enqueue(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: NewOutboxEvent,
    ) -> Result<(), OutboxError> {
        sqlx::query(
            r"
            INSERT INTO outbox_events
                (event_id, event_type, payload, correlation_id, routing_key)
            VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(event.event_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(&event.correlation_id)
        .bind(&event.routing_key)
        .execute(&mut **tx)
        .await?;

        tracing::debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            correlation_id = %event.correlation_id,
            "Outbox event enqueued"
        );

        Ok(())
    }

    /// Load one event by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] on query failure.
    pub async fn fetch(&self, event_id: Uuid) -> Result<Option<OutboxEvent>, OutboxError> {
        let row = sqlx::query(&format!("{SELECT_EVENT} WHERE event_id = $1"))
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_event).transpose()
    }

    /// Load one event by change-feed position.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] on query failure.
    pub async fn fetch_by_seq(&self, seq: i64) -> Result<Option<OutboxEvent>, OutboxError> {
        let row = sqlx::query(&format!("{SELECT_EVENT} WHERE seq = $1"))
            .bind(seq)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_event).transpose()
    }

    /// PENDING events whose retry slot has arrived (or that never failed),
    /// oldest first. This is the startup scan: events stranded while the
    /// service was down are picked up here before the feed is reopened.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] on query failure.
    pub async fn due_pending(&self, limit: i64) -> Result<Vec<OutboxEvent>, OutboxError> {
        let rows = sqlx::query(&format!(
            r"
            {SELECT_EVENT}
            WHERE status = 'PENDING'
              AND (next_retry_at IS NULL OR next_retry_at <= NOW())
            ORDER BY seq ASC
            LIMIT $1
            "
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    /// Mark an event PUBLISHED with the acknowledgement time.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::EventNotFound`] if no row matched.
    pub async fn mark_published(&self, event_id: Uuid) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r"
            UPDATE outbox_events
            SET status = 'PUBLISHED', published_at = NOW(), last_error = NULL
            WHERE event_id = $1
            ",
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::EventNotFound(event_id));
        }

        metrics::counter!("outbox.published").increment(1);
        Ok(())
    }

    /// Record a failed publish attempt: bump the retry counter, stamp the
    /// error, and schedule the next slot at `now + 2^retries · 1s`.
    ///
    /// Returns the new retry count.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::EventNotFound`] if the event is gone or no
    /// longer PENDING.
    pub async fn record_failure(&self, event_id: Uuid, error: &str) -> Result<i32, OutboxError> {
        let row = sqlx::query(
            r"
            UPDATE outbox_events
            SET retries = retries + 1,
                last_error = $2,
                next_retry_at = NOW() + (interval '1 second' * power(2, retries + 1))
            WHERE event_id = $1 AND status = 'PENDING'
            RETURNING retries
            ",
        )
        .bind(event_id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        let retries: i32 = row
            .ok_or(OutboxError::EventNotFound(event_id))?
            .get("retries");

        tracing::warn!(
            event_id = %event_id,
            retries,
            error,
            "Outbox publish attempt failed"
        );

        Ok(retries)
    }

    /// Park an event as FAILED. Used after the retry budget is exhausted or
    /// when the payload is unserializable.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::EventNotFound`] if no row matched.
    pub async fn mark_failed(&self, event_id: Uuid, error: &str) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r"
            UPDATE outbox_events
            SET status = 'FAILED', last_error = $2
            WHERE event_id = $1
            ",
        )
        .bind(event_id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::EventNotFound(event_id));
        }

        tracing::error!(event_id = %event_id, error, "Outbox event parked as FAILED");
        metrics::counter!("outbox.failed").increment(1);
        Ok(())
    }

    /// Operator action: put a FAILED (or stuck PENDING) event back at the
    /// front of the queue with a fresh retry budget. This is the only path
    /// by which a PUBLISHED or FAILED event returns to PENDING.
    ///
    /// Returns `true` when an event was actually reset.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] on query failure.
    pub async fn retry_manually(&self, event_id: Uuid) -> Result<bool, OutboxError> {
        let result = sqlx::query(
            r"
            UPDATE outbox_events
            SET status = 'PENDING', retries = 0, next_retry_at = NULL, last_error = NULL
            WHERE event_id = $1 AND status = 'FAILED'
            ",
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        let reset = result.rows_affected() > 0;
        if reset {
            tracing::info!(event_id = %event_id, "Outbox event manually requeued");
        }
        Ok(reset)
    }

    /// FAILED events for the operator surface, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] on query failure.
    pub async fn list_failed(&self, limit: i64) -> Result<Vec<OutboxEvent>, OutboxError> {
        let rows = sqlx::query(&format!(
            "{SELECT_EVENT} WHERE status = 'FAILED' ORDER BY seq ASC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    /// Pending backlog size and the age of its oldest entry in seconds, for
    /// the relay lag gauges.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] on query failure.
    pub async fn pending_stats(&self) -> Result<(i64, i64), OutboxError> {
        let row = sqlx::query(
            r"
            SELECT COUNT(*)::BIGINT AS pending,
                   COALESCE(EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT, 0) AS age_seconds
            FROM outbox_events
            WHERE status = 'PENDING'
            ",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok((row.get("pending"), row.get("age_seconds")))
    }

    /// Resume token of the change feed.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] on query failure.
    pub async fn load_cursor(&self) -> Result<i64, OutboxError> {
        let row = sqlx::query("SELECT last_seq FROM outbox_relay_cursor WHERE id")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("last_seq"))
    }

    /// Persist the resume token. Called for every notification before the
    /// event is acted on, so a crash never replays more than the in-flight
    /// event.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] on query failure.
    pub async fn save_cursor(&self, seq: i64) -> Result<(), OutboxError> {
        sqlx::query(
            r"
            UPDATE outbox_relay_cursor
            SET last_seq = GREATEST(last_seq, $1), updated_at = NOW()
            WHERE id
            ",
        )
        .bind(seq)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

const SELECT_EVENT: &str = r"
    SELECT seq, event_id, event_type, payload, correlation_id, routing_key,
           status, retries, next_retry_at, published_at, last_error, created_at
    FROM outbox_events
";

fn row_to_event(row: &PgRow) -> Result<OutboxEvent, OutboxError> {
    let status: String = row.get("status");
    Ok(OutboxEvent {
        seq: row.get("seq"),
        event_id: row.get("event_id"),
        event_type: row.get("event_type"),
        payload: row.get("payload"),
        correlation_id: row.get("correlation_id"),
        routing_key: row.get("routing_key"),
        status: OutboxStatus::parse(&status)?,
        retries: row.get("retries"),
        next_retry_at: row.get("next_retry_at"),
        published_at: row.get("published_at"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
    })
}

/// Backoff before attempt `retries + 1`: `2^retries` seconds.
#[must_use]
pub fn retry_delay(retries: i32) -> Duration {
    let exponent = u32::try_from(retries).unwrap_or(0).min(30);
    Duration::seconds(i64::from(2u32.saturating_pow(exponent)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Published,
            OutboxStatus::Failed,
        ] {
            assert_eq!(OutboxStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(OutboxStatus::parse("SHIPPED").is_err());
    }

    #[test]
    fn retry_delay_doubles() {
        assert_eq!(retry_delay(0), Duration::seconds(1));
        assert_eq!(retry_delay(1), Duration::seconds(2));
        assert_eq!(retry_delay(4), Duration::seconds(16));
        // Negative counts (cannot happen, but the cast is total) fall back
        // to the base delay.
        assert_eq!(retry_delay(-1), Duration::seconds(1));
    }

    #[test]
    fn queue_defaults_to_event_type() {
        let event = OutboxEvent {
            seq: 1,
            event_id: Uuid::new_v4(),
            event_type: "order.created".into(),
            payload: serde_json::json!({}),
            correlation_id: "c".into(),
            routing_key: None,
            status: OutboxStatus::Pending,
            retries: 0,
            next_retry_at: None,
            published_at: None,
            last_error: None,
            created_at: Utc::now(),
        };
        assert_eq!(event.queue(), "order.created");

        let routed = OutboxEvent {
            routing_key: Some("order.release".into()),
            ..event
        };
        assert_eq!(routed.queue(), "order.release");
    }
}
