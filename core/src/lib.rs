//! Core domain types and traits for the souk order fabric.
//!
//! This crate holds everything the services share but infrastructure does not
//! own: the wire envelope and event-name constants, the order domain model,
//! the pure saga state machine, the handler error taxonomy that drives
//! ack/nack decisions at the broker, declarative message schemas, and the
//! publisher/marker-store traits the infrastructure crates implement.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐   enqueue    ┌─────────────┐   publish   ┌─────────────┐
//! │  Service    │─────────────►│   Outbox    │────────────►│   Broker    │
//! │  (order,    │  (same tx)   │  (Postgres) │  (AMQP)     │  (queues +  │
//! │  inventory, │              └─────────────┘             │   DLQs)     │
//! │  payment,   │                                          └──────┬──────┘
//! │  seckill)   │◄────────────────────────────────────────────────┘
//! └─────────────┘        consume (idempotent, schema-checked)
//! ```
//!
//! Everything here is pure or trait-shaped: no sqlx, no lapin, no redis.
//! That keeps the saga logic testable without any infrastructure running.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bus;
pub mod envelope;
pub mod error;
pub mod order;
pub mod saga;
pub mod schema;

pub use bus::{BusError, EventPublisher, ProcessedStore};
pub use envelope::{DeliveryMetadata, EventEnvelope};
pub use error::{HandlerError, HandlerOutcome};
pub use order::{Order, OrderItem, OrderMetadata, OrderSource, OrderStatus};
pub use saga::{SagaTrigger, TransitionError};
pub use schema::{FieldKind, FieldSpec, MessageSchema, SchemaViolation};
