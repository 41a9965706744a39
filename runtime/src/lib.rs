//! Resilience and observability runtime for the souk order fabric.
//!
//! Synchronous inter-service calls ride on a fixed composition: a hard
//! per-request timeout, bounded retry with exponential backoff, and a
//! rolling-window circuit breaker per dependency. This crate provides those
//! pieces plus the W3C trace-context propagation used on both the HTTP and
//! the message plane, and the per-binary telemetry bootstrap.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod circuit_breaker;
pub mod http;
pub mod retry;
pub mod telemetry;
pub mod trace;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, State};
pub use http::{ClientRegistry, HttpClientError, ResilientClient};
pub use retry::{retry_with_policy, RetryPolicy};
