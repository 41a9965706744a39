//! Transactional outbox for the souk order fabric.
//!
//! Guarantees that a business state change and its outbound event are either
//! both observable downstream or neither, without distributed transactions:
//! the caller inserts the event into the `outbox_events` table inside the
//! same Postgres transaction as the business write, and a per-service
//! [`relay::OutboxRelay`] publishes committed events to the broker.
//!
//! # Delivery semantics
//!
//! At-least-once. The relay marks an event PUBLISHED only after the broker
//! acknowledged it; a crash between publish and mark leaves the event
//! PENDING and it is republished on restart. Consumers deduplicate on the
//! event identifier (`processed:{eventId}` markers), so duplicates are
//! harmless.
//!
//! # Example
//!
//! ```no_run
//! use souk_outbox::{NewOutboxEvent, OutboxStore};
//! use serde_json::json;
//! use uuid::Uuid;
//!
//! # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
//! let store = OutboxStore::new(pool.clone());
//! let mut tx = pool.begin().await?;
//!
//! // ... mutate the owning entity in the same transaction ...
//!
//! store
//!     .enqueue(
//!         &mut tx,
//!         NewOutboxEvent {
//!             event_id: Uuid::new_v4(),
//!             event_type: "order.created".into(),
//!             payload: json!({"orderId": "o-1"}),
//!             correlation_id: "corr-1".into(),
//!             routing_key: None,
//!         },
//!     )
//!     .await?;
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod relay;
mod store;

pub use relay::OutboxRelay;
pub use store::{NewOutboxEvent, OutboxError, OutboxEvent, OutboxStatus, OutboxStore};

/// Embedded migrations: the outbox tables, the relay cursor, and the
/// change-feed trigger. Every owning service runs these against its own
/// database alongside its domain migrations.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
