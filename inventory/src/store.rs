//! Atomic inventory operations.
//!
//! The invariants (`available >= 0`, `reserved >= 0`) are enforced by the
//! WHERE guard of each UPDATE, not by application-level checks: a statement
//! that would violate them simply matches no row, and the zero-rows case is
//! translated into the distinguished domain error.

use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::{PgExecutor, PgPool, Row};
use thiserror::Error;

/// Errors from inventory operations.
#[derive(Error, Debug)]
pub enum InventoryError {
    /// Not enough free stock to reserve.
    #[error("insufficient stock for {product_id}: requested {requested}")]
    InsufficientStock {
        /// Product.
        product_id: String,
        /// Quantity that was requested.
        requested: i64,
    },

    /// Release would drive `reserved` negative. Compensation callers treat
    /// this as already-released.
    #[error("cannot release {requested} of {product_id}: not that much reserved")]
    CannotRelease {
        /// Product.
        product_id: String,
        /// Quantity that was requested.
        requested: i64,
    },

    /// Confirm would drive `reserved` negative.
    #[error("cannot confirm {requested} of {product_id}: not that much reserved")]
    CannotConfirm {
        /// Product.
        product_id: String,
        /// Quantity that was requested.
        requested: i64,
    },

    /// No record for the product.
    #[error("no inventory record for {0}")]
    NotFound(String),

    /// The quantity was zero or negative.
    #[error("quantity must be positive, got {0}")]
    InvalidQuantity(i64),

    /// Underlying database failure.
    #[error("inventory database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for InventoryError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Per-product stock record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryRecord {
    /// Product identifier.
    pub product_id: String,
    /// Units free to reserve.
    pub available: i64,
    /// Units reserved but not yet confirmed.
    pub reserved: i64,
    /// Mutation counter.
    pub version: i64,
}

fn row_to_record(row: &PgRow) -> InventoryRecord {
    InventoryRecord {
        product_id: row.get("product_id"),
        available: row.get("available"),
        reserved: row.get("reserved"),
        version: row.get("version"),
    }
}

/// Access to the `inventory_records` table.
#[derive(Clone)]
pub struct InventoryStore {
    pool: PgPool,
}

impl InventoryStore {
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

    /// Create a record when a product is created. Idempotent on conflict.
    ///
    /// # Errors
    ///
    /// [`InventoryError::Database`] on query failure.
    pub async fn create_record(
        &self,
        product_id: &str,
        available: i64,
    ) -> Result<InventoryRecord, InventoryError> {
        if available < 0 {
            return Err(InventoryError::InvalidQuantity(available));
        }
        let row = sqlx::query(
            r"
            INSERT INTO inventory_records (product_id, available)
            VALUES ($1, $2)
            ON CONFLICT (product_id) DO UPDATE
                SET updated_at = NOW()
            RETURNING product_id, available, reserved, version
            ",
        )
        .bind(product_id)
        .bind(available)
        .fetch_one(&self.pool)
        .await?;
        Ok(row_to_record(&row))
    }

    /// Delete a record when its product is deleted.
    ///
    /// # Errors
    ///
    /// [`InventoryError::Database`] on query failure.
    pub async fn delete_record(&self, product_id: &str) -> Result<bool, InventoryError> {
        let result = sqlx::query("DELETE FROM inventory_records WHERE product_id = $1")
            .bind(product_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Load a record.
    ///
    /// # Errors
    ///
    /// [`InventoryError::NotFound`] when the product has no record.
    pub async fn get(&self, product_id: &str) -> Result<InventoryRecord, InventoryError> {
        let row = sqlx::query(
            "SELECT product_id, available, reserved, version FROM inventory_records WHERE product_id = $1",
        )
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref()
            .map(row_to_record)
            .ok_or_else(|| InventoryError::NotFound(product_id.to_string()))
    }

    /// Reserve: `available -= qty`, `reserved += qty`, atomically, guarded
    /// by `available >= qty`.
    ///
    /// # Errors
    ///
    /// [`InventoryError::InsufficientStock`] when the guard rejects,
    /// [`InventoryError::NotFound`] when the product has no record.
    pub async fn reserve(
        &self,
        product_id: &str,
        quantity: i64,
    ) -> Result<InventoryRecord, InventoryError> {
        self.reserve_with(&self.pool, product_id, quantity).await
    }

    /// Reserve on an explicit executor (a transaction in the reservation
    /// handler, so multiple lines commit or roll back together).
    ///
    /// # Errors
    ///
    /// As [`InventoryStore::reserve`].
    pub async fn reserve_with<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        product_id: &str,
        quantity: i64,
    ) -> Result<InventoryRecord, InventoryError> {
        if quantity <= 0 {
            return Err(InventoryError::InvalidQuantity(quantity));
        }
        let row = sqlx::query(
            r"
            UPDATE inventory_records
            SET available = available - $2,
                reserved = reserved + $2,
                version = version + 1,
                updated_at = NOW()
            WHERE product_id = $1 AND available >= $2
            RETURNING product_id, available, reserved, version
            ",
        )
        .bind(product_id)
        .bind(quantity)
        .fetch_optional(executor)
        .await?;

        match row {
            Some(row) => Ok(row_to_record(&row)),
            None => Err(self
                .classify_guard_miss(product_id, quantity, GuardKind::Reserve)
                .await),
        }
    }

    /// Release: `reserved -= qty`, `available += qty`, guarded by
    /// `reserved >= qty`.
    ///
    /// # Errors
    ///
    /// [`InventoryError::CannotRelease`] when the guard rejects (treated as
    /// idempotent success by compensation callers).
    pub async fn release(
        &self,
        product_id: &str,
        quantity: i64,
    ) -> Result<InventoryRecord, InventoryError> {
        if quantity <= 0 {
            return Err(InventoryError::InvalidQuantity(quantity));
        }
        let row = sqlx::query(
            r"
            UPDATE inventory_records
            SET reserved = reserved - $2,
                available = available + $2,
                version = version + 1,
                updated_at = NOW()
            WHERE product_id = $1 AND reserved >= $2
            RETURNING product_id, available, reserved, version
            ",
        )
        .bind(product_id)
        .bind(quantity)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row_to_record(&row)),
            None => Err(self
                .classify_guard_miss(product_id, quantity, GuardKind::Release)
                .await),
        }
    }

    /// Confirm: `reserved -= qty` (the stock has left the system).
    ///
    /// # Errors
    ///
    /// [`InventoryError::CannotConfirm`] when the guard rejects.
    pub async fn confirm(
        &self,
        product_id: &str,
        quantity: i64,
    ) -> Result<InventoryRecord, InventoryError> {
        if quantity <= 0 {
            return Err(InventoryError::InvalidQuantity(quantity));
        }
        let row = sqlx::query(
            r"
            UPDATE inventory_records
            SET reserved = reserved - $2,
                version = version + 1,
                updated_at = NOW()
            WHERE product_id = $1 AND reserved >= $2
            RETURNING product_id, available, reserved, version
            ",
        )
        .bind(product_id)
        .bind(quantity)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row_to_record(&row)),
            None => Err(self
                .classify_guard_miss(product_id, quantity, GuardKind::Confirm)
                .await),
        }
    }

    /// Blind decrement for flash-sale orders: the campaign pool already
    /// took the stock, so the long-term record just follows, floored at
    /// zero. Reconciliation against the campaign is an offline concern.
    ///
    /// # Errors
    ///
    /// [`InventoryError::Database`] on query failure. A missing record is
    /// not an error: the campaign is authoritative on the hot path.
    pub async fn debit<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        product_id: &str,
        quantity: i64,
    ) -> Result<(), InventoryError> {
        if quantity <= 0 {
            return Err(InventoryError::InvalidQuantity(quantity));
        }
        sqlx::query(
            r"
            UPDATE inventory_records
            SET available = GREATEST(available - $2, 0),
                version = version + 1,
                updated_at = NOW()
            WHERE product_id = $1
            ",
        )
        .bind(product_id)
        .bind(quantity)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// A guarded UPDATE matched no row: distinguish "no record" from
    /// "guard rejected".
    async fn classify_guard_miss(
        &self,
        product_id: &str,
        quantity: i64,
        kind: GuardKind,
    ) -> InventoryError {
        match self.get(product_id).await {
            Ok(_) => match kind {
                GuardKind::Reserve => InventoryError::InsufficientStock {
                    product_id: product_id.to_string(),
                    requested: quantity,
                },
                GuardKind::Release => InventoryError::CannotRelease {
                    product_id: product_id.to_string(),
                    requested: quantity,
                },
                GuardKind::Confirm => InventoryError::CannotConfirm {
                    product_id: product_id.to_string(),
                    requested: quantity,
                },
            },
            Err(err) => err,
        }
    }
}

#[derive(Clone, Copy)]
enum GuardKind {
    Reserve,
    Release,
    Confirm,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_render_their_codes() {
        let err = InventoryError::InsufficientStock {
            product_id: "p-1".into(),
            requested: 5,
        };
        assert!(err.to_string().contains("insufficient stock"));

        let err = InventoryError::CannotRelease {
            product_id: "p-1".into(),
            requested: 5,
        };
        assert!(err.to_string().contains("cannot release"));
    }

    #[tokio::test]
    async fn zero_quantity_is_rejected_before_touching_the_database() {
        // connect_lazy never opens a socket, so guard checks that fire
        // before any query are testable without Postgres.
        let pool = PgPool::connect_lazy("postgres://localhost/unused")
            .unwrap_or_else(|_| unreachable!("lazy connect does not fail"));
        let store = InventoryStore::new(pool);

        assert!(matches!(
            store.reserve("p-1", 0).await,
            Err(InventoryError::InvalidQuantity(0))
        ));
        assert!(matches!(
            store.release("p-1", -2).await,
            Err(InventoryError::InvalidQuantity(-2))
        ));
    }
}
