//! Payment persistence.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;
use uuid::Uuid;

/// Errors from payment persistence.
#[derive(Error, Debug)]
pub enum PaymentStoreError {
    /// Underlying database failure.
    #[error("payment database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for PaymentStoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Terminal state of a payment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    /// The charge was captured.
    Succeeded,
    /// The charge was declined.
    Failed,
}

impl PaymentStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }
}

/// A persisted payment attempt.
#[derive(Debug, Clone)]
pub struct PaymentRecord {
    /// Payment identifier.
    pub id: Uuid,
    /// Order this payment settles.
    pub order_id: Uuid,
    /// Amount in cents.
    pub amount_cents: i64,
    /// Currency code.
    pub currency: String,
    /// Processor transaction id (present on success).
    pub transaction_id: Option<String>,
    /// Outcome.
    pub status: PaymentStatus,
    /// Decline reason (present on failure).
    pub failure_reason: Option<String>,
    /// When the attempt was recorded.
    pub created_at: DateTime<Utc>,
}

/// Access to the `payments` table.
#[derive(Clone)]
pub struct PaymentStore {
    pool: PgPool,
}

impl PaymentStore {
    /// Create a store over the service's pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool (the handler opens its dual-write transaction
    /// on it).
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a payment record inside the caller's transaction (alongside
    /// the outbox event announcing the outcome).
    ///
    /// # Errors
    ///
    /// [`PaymentStoreError::Database`] on insert failure.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record: &PaymentRecord,
    ) -> Result<(), PaymentStoreError> {
        sqlx::query(
            r"
            INSERT INTO payments
                (id, order_id, amount_cents, currency, transaction_id,
                 status, failure_reason, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(record.id)
        .bind(record.order_id)
        .bind(record.amount_cents)
        .bind(&record.currency)
        .bind(&record.transaction_id)
        .bind(record.status.as_str())
        .bind(&record.failure_reason)
        .bind(record.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Whether a successful payment already exists for the order.
    /// Cross-event idempotency: a replayed `order.confirmed` with a fresh
    /// event id must not double-charge.
    ///
    /// # Errors
    ///
    /// [`PaymentStoreError::Database`] on query failure.
    pub async fn has_succeeded(&self, order_id: Uuid) -> Result<bool, PaymentStoreError> {
        let row = sqlx::query(
            "SELECT 1 FROM payments WHERE order_id = $1 AND status = 'SUCCEEDED' LIMIT 1",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings() {
        assert_eq!(PaymentStatus::Succeeded.as_str(), "SUCCEEDED");
        assert_eq!(PaymentStatus::Failed.as_str(), "FAILED");
    }
}
