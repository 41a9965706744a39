//! Payment service for the souk order fabric.
//!
//! Consumes `order.confirmed`, runs the charge through the gateway
//! abstraction, persists the payment record, and emits
//! `payment.succeeded` or `payment.failed` through its own outbox.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod gateway;
pub mod handlers;
pub mod store;

pub use config::Config;
pub use gateway::{GatewayError, MockPaymentGateway, PaymentGateway};
pub use store::{PaymentRecord, PaymentStatus, PaymentStore};

/// Embedded migrations for the payment database.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
