//! Inventory service for the souk order fabric.
//!
//! Owns per-product stock. Every mutation is one of four atomic guarded
//! operations (reserve, release, confirm, debit) expressed as single SQL
//! statements so the non-negativity invariants hold under any concurrency
//! (there is no read-modify-write anywhere).
//!
//! The service consumes `order.created` (reservation), `order.release`,
//! `order.timeout`, and `payment.failed` (compensation), and exposes the
//! reserve/release HTTP endpoints plus record CRUD used by the product
//! service at product creation/deletion time.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod api;
pub mod config;
pub mod handlers;
pub mod store;

pub use config::Config;
pub use store::{InventoryError, InventoryRecord, InventoryStore};

/// Embedded migrations for the inventory database.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
