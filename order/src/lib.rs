//! Order service for the souk order fabric.
//!
//! Owns the authoritative order lifecycle. The HTTP surface creates orders
//! (validating products through the resilient client) and serves reads; the
//! saga handlers drive every status change off the message plane; the
//! timeout worker reclaims orders the saga never finished.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod api;
pub mod config;
pub mod handlers;
pub mod store;
pub mod timeout;

pub use config::Config;
pub use store::{OrderStore, OrderStoreError};

/// Embedded migrations for the order database.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
