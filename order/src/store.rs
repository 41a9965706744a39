//! Order persistence.
//!
//! The order row is mutated only inside transactions that also enqueue the
//! follow-on outbox events, and every status write is guarded by the
//! expected current status so a racing handler cannot clobber a transition
//! that beat it to the commit.

use chrono::{DateTime, Duration, Utc};
use souk_core::order::{Order, OrderItem, OrderMetadata, OrderSource, OrderStatus};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use thiserror::Error;
use uuid::Uuid;

/// Errors from order persistence.
#[derive(Error, Debug)]
pub enum OrderStoreError {
    /// Underlying database failure.
    #[error("order database error: {0}")]
    Database(String),

    /// A stored row did not decode into the domain model.
    #[error("corrupt order row {id}: {reason}")]
    Corrupt {
        /// Offending order.
        id: Uuid,
        /// What failed to decode.
        reason: String,
    },
}

impl From<sqlx::Error> for OrderStoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Access to the `orders` table.
#[derive(Clone)]
pub struct OrderStore {
    pool: PgPool,
}

impl OrderStore {
    /// Create a store over the service's pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool (handlers open transactions on it).
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a new order inside the caller's transaction. The caller
    /// enqueues the `order.created` outbox event in the same transaction,
    /// which is what makes the dual write atomic.
    ///
    /// # Errors
    ///
    /// [`OrderStoreError::Database`] on insert failure.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        order: &Order,
    ) -> Result<(), OrderStoreError> {
        let items = serde_json::to_value(&order.items)
            .map_err(|e| OrderStoreError::Corrupt {
                id: order.id,
                reason: e.to_string(),
            })?;

        sqlx::query(
            r"
            INSERT INTO orders
                (id, user_id, items, total_price_cents, status,
                 source, seckill_ref, correlation_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ",
        )
        .bind(order.id)
        .bind(&order.user_id)
        .bind(items)
        .bind(order.total_price_cents)
        .bind(order.status.as_str())
        .bind(order.metadata.source.as_str())
        .bind(&order.metadata.seckill_ref)
        .bind(&order.metadata.correlation_id)
        .bind(order.created_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Load an order.
    ///
    /// # Errors
    ///
    /// [`OrderStoreError::Database`] on query failure,
    /// [`OrderStoreError::Corrupt`] when a row does not decode.
    pub async fn fetch(&self, id: Uuid) -> Result<Option<Order>, OrderStoreError> {
        let row = sqlx::query(&format!("{SELECT_ORDER} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_order).transpose()
    }

    /// Write a status transition, guarded by the expected current status.
    /// Optionally rewrites the item list (to flip `reserved` flags) and the
    /// cancellation reason.
    ///
    /// Returns `false` when the guard rejected: the order moved under us,
    /// and the caller should re-read and re-apply the state machine.
    ///
    /// # Errors
    ///
    /// [`OrderStoreError::Database`] on query failure.
    pub async fn transition(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        cancellation_reason: Option<&str>,
        items: Option<&[OrderItem]>,
    ) -> Result<bool, OrderStoreError> {
        let items_json = match items {
            Some(items) => Some(serde_json::to_value(items).map_err(|e| {
                OrderStoreError::Corrupt {
                    id,
                    reason: e.to_string(),
                }
            })?),
            None => None,
        };

        let result = sqlx::query(
            r"
            UPDATE orders
            SET status = $3,
                cancellation_reason = COALESCE($4, cancellation_reason),
                items = COALESCE($5, items),
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            ",
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(cancellation_reason)
        .bind(items_json)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// PENDING orders older than `max_age`, oldest first, for the timeout
    /// worker.
    ///
    /// # Errors
    ///
    /// [`OrderStoreError::Database`] on query failure.
    pub async fn stale_pending(
        &self,
        max_age: Duration,
        limit: i64,
    ) -> Result<Vec<Order>, OrderStoreError> {
        let cutoff = Utc::now() - max_age;
        let rows = sqlx::query(&format!(
            "{SELECT_ORDER} WHERE status = 'PENDING' AND created_at < $1 ORDER BY created_at ASC LIMIT $2"
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_order).collect()
    }
}

const SELECT_ORDER: &str = r"
    SELECT id, user_id, items, total_price_cents, status, cancellation_reason,
           source, seckill_ref, correlation_id, created_at
    FROM orders
";

fn row_to_order(row: &PgRow) -> Result<Order, OrderStoreError> {
    let id: Uuid = row.get("id");
    let corrupt = |reason: String| OrderStoreError::Corrupt { id, reason };

    let items_json: serde_json::Value = row.get("items");
    let items: Vec<OrderItem> =
        serde_json::from_value(items_json).map_err(|e| corrupt(e.to_string()))?;

    let status_str: String = row.get("status");
    let status = OrderStatus::parse(&status_str).map_err(corrupt)?;

    let source_str: String = row.get("source");
    let source = match source_str.as_str() {
        "seckill" => OrderSource::Seckill,
        _ => OrderSource::Regular,
    };

    let created_at: DateTime<Utc> = row.get("created_at");

    Ok(Order {
        id,
        user_id: row.get("user_id"),
        items,
        total_price_cents: row.get("total_price_cents"),
        status,
        cancellation_reason: row.get("cancellation_reason"),
        metadata: OrderMetadata {
            source,
            seckill_ref: row.get("seckill_ref"),
            correlation_id: row.get("correlation_id"),
        },
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlx_errors_wrap_as_database() {
        let err = OrderStoreError::from(sqlx::Error::PoolClosed);
        assert!(matches!(err, OrderStoreError::Database(_)));
    }
}
