//! Resilient outbound HTTP client.
//!
//! Synchronous inter-service reads (product metadata and similar) go through
//! a fixed composition, configured once per target service and reused:
//!
//! 1. a hard per-request timeout (default 3 s, reset on every retry),
//! 2. bounded retry on network errors and 5xx responses
//!    (`min(1s, 100ms · 2^attempt)`, 3 attempts),
//! 3. a rolling-window circuit breaker around the retrying client.
//!
//! Callers see `CIRCUIT_OPEN` when the breaker rejects and `TIMEOUT` on a
//! deadline; both mean "retry later, maybe serve cached data". Everything
//! else surfaces the original transport or HTTP error.
//!
//! # Example
//!
//! ```no_run
//! use souk_runtime::http::ResilientClient;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Product { id: String, name: String }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ResilientClient::builder()
//!     .name("product-service")
//!     .base_url("http://product-service:3000")
//!     .build()?;
//!
//! let product: Product = client.get_json("/api/products/p-1").await?;
//! # Ok(())
//! # }
//! ```

use crate::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerSnapshot,
};
use crate::retry::{retry_with_policy, RetryPolicy};
use crate::trace::inject_trace_headers;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors surfaced to callers of the resilient client.
#[derive(Error, Debug)]
pub enum HttpClientError {
    /// The circuit breaker rejected the call without executing it.
    #[error("circuit open for {0:?}")]
    CircuitOpen(
        /// Remaining cooldown before the next probe.
        Duration,
    ),

    /// The per-request deadline elapsed.
    #[error("request timed out")]
    Timeout,

    /// The dependency answered with a non-success status.
    #[error("upstream returned {status}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// Connection-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The response body did not decode into the expected shape.
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// The client could not be constructed.
    #[error("client configuration error: {0}")]
    Config(String),
}

impl HttpClientError {
    /// Stable machine-readable code (mirrored into HTTP error bodies).
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::CircuitOpen(_) => "CIRCUIT_OPEN",
            Self::Timeout => "TIMEOUT",
            Self::Status { .. } => "UPSTREAM_STATUS",
            Self::Transport(_) => "TRANSPORT",
            Self::Decode(_) => "DECODE",
            Self::Config(_) => "CONFIG",
        }
    }

    /// Whether the caller should treat this as retry-later (and may serve
    /// cached data instead).
    #[must_use]
    pub const fn is_retry_later(&self) -> bool {
        matches!(self, Self::CircuitOpen(_) | Self::Timeout)
    }

    /// Whether the retry layer may run another attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Transport(_) => true,
            Self::Status { status, .. } => *status >= 500,
            Self::CircuitOpen(_) | Self::Decode(_) | Self::Config(_) => false,
        }
    }

    fn classify_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Resilient HTTP client for one target service.
#[derive(Clone)]
pub struct ResilientClient {
    name: String,
    base_url: String,
    http: reqwest::Client,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
}

impl ResilientClient {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> ResilientClientBuilder {
        ResilientClientBuilder::default()
    }

    /// Target name (also the breaker name on the status endpoint).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker status snapshot for `/circuit-breaker/status`.
    pub async fn breaker_snapshot(&self) -> CircuitBreakerSnapshot {
        self.breaker.snapshot().await
    }

    /// GET a JSON resource.
    ///
    /// # Errors
    ///
    /// See [`HttpClientError`]; `CircuitOpen` and `Timeout` are
    /// retry-later conditions.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, HttpClientError> {
        self.request_json(Method::GET, path, None::<&()>).await
    }

    /// POST a JSON body and decode the JSON response.
    ///
    /// # Errors
    ///
    /// See [`HttpClientError`].
    pub async fn post_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, HttpClientError> {
        self.request_json(Method::POST, path, Some(body)).await
    }

    async fn request_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, HttpClientError> {
        let url = format!("{}{}", self.base_url, path);

        let result = self
            .breaker
            .call(|| {
                retry_with_policy(
                    &self.retry,
                    || self.attempt(method.clone(), &url, body),
                    HttpClientError::is_retryable,
                )
            })
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(CircuitBreakerError::Open { retry_after }) => {
                Err(HttpClientError::CircuitOpen(retry_after))
            }
            Err(CircuitBreakerError::Inner(err)) => Err(err),
        }
    }

    /// One attempt: trace headers in, status classified out.
    async fn attempt<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
    ) -> Result<T, HttpClientError> {
        let mut request = self.http.request(method, url);
        for (key, value) in inject_trace_headers(&tracing::Span::current()) {
            request = request.header(key, value);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| HttpClientError::classify_reqwest(&e))?;

        let status = response.status();
        if status.is_success() {
            response
                .json::<T>()
                .await
                .map_err(|e| HttpClientError::Decode(e.to_string()))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(HttpClientError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// Builder for [`ResilientClient`].
#[derive(Default)]
pub struct ResilientClientBuilder {
    name: Option<String>,
    base_url: Option<String>,
    timeout: Option<Duration>,
    retry: Option<RetryPolicy>,
    breaker: Option<CircuitBreakerConfig>,
}

impl ResilientClientBuilder {
    /// Set the target name (used for the breaker and status endpoint).
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the base URL, e.g. `http://product-service:3000`.
    #[must_use]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Set the hard per-request timeout (default 3 s).
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Override the breaker configuration.
    #[must_use]
    pub fn breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = Some(config);
        self
    }

    /// Build the client.
    ///
    /// # Errors
    ///
    /// [`HttpClientError::Config`] when required fields are missing or the
    /// underlying client cannot be constructed.
    pub fn build(self) -> Result<ResilientClient, HttpClientError> {
        let name = self
            .name
            .ok_or_else(|| HttpClientError::Config("name not set".into()))?;
        let base_url = self
            .base_url
            .ok_or_else(|| HttpClientError::Config("base_url not set".into()))?
            .trim_end_matches('/')
            .to_string();

        let http = reqwest::Client::builder()
            .timeout(self.timeout.unwrap_or(Duration::from_secs(3)))
            .build()
            .map_err(|e| HttpClientError::Config(e.to_string()))?;

        let breaker = CircuitBreaker::new(&name, self.breaker.unwrap_or_default());

        Ok(ResilientClient {
            name,
            base_url,
            http,
            retry: self.retry.unwrap_or_default(),
            breaker,
        })
    }
}

/// Registry of resilient clients, backing `/circuit-breaker/status`.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    clients: Arc<RwLock<Vec<ResilientClient>>>,
}

impl ClientRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client (its breaker state becomes visible on the status
    /// endpoint).
    pub async fn register(&self, client: &ResilientClient) {
        self.clients.write().await.push(client.clone());
    }

    /// Status document: `{"circuits": {name: {state, stats...}}}`.
    pub async fn status(&self) -> serde_json::Value {
        let clients = self.clients.read().await;
        let mut circuits = serde_json::Map::new();
        for client in clients.iter() {
            let snapshot = client.breaker_snapshot().await;
            circuits.insert(
                client.name().to_string(),
                serde_json::to_value(snapshot).unwrap_or(serde_json::Value::Null),
            );
        }
        serde_json::json!({ "circuits": circuits })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(
            HttpClientError::CircuitOpen(Duration::from_secs(30)).code(),
            "CIRCUIT_OPEN"
        );
        assert_eq!(HttpClientError::Timeout.code(), "TIMEOUT");
        assert!(HttpClientError::CircuitOpen(Duration::ZERO).is_retry_later());
        assert!(HttpClientError::Timeout.is_retry_later());
        assert!(!HttpClientError::Transport("x".into()).is_retry_later());
    }

    #[test]
    fn retryability_follows_the_contract() {
        assert!(HttpClientError::Timeout.is_retryable());
        assert!(HttpClientError::Transport("refused".into()).is_retryable());
        assert!(HttpClientError::Status { status: 503, body: String::new() }.is_retryable());
        assert!(!HttpClientError::Status { status: 404, body: String::new() }.is_retryable());
        assert!(!HttpClientError::CircuitOpen(Duration::ZERO).is_retryable());
    }

    #[test]
    fn builder_requires_name_and_base_url() {
        assert!(matches!(
            ResilientClient::builder().build(),
            Err(HttpClientError::Config(_))
        ));
        assert!(matches!(
            ResilientClient::builder().name("dep").build(),
            Err(HttpClientError::Config(_))
        ));
        assert!(ResilientClient::builder()
            .name("dep")
            .base_url("http://localhost:1/")
            .build()
            .is_ok());
    }

    #[tokio::test]
    async fn refused_connection_surfaces_transport_after_retries() {
        let client = ResilientClient::builder()
            .name("dead-dep")
            .base_url("http://127.0.0.1:1")
            .timeout(Duration::from_millis(200))
            .retry(RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            })
            .build()
            .unwrap();

        let result: Result<serde_json::Value, _> = client.get_json("/anything").await;
        assert!(matches!(
            result,
            Err(HttpClientError::Transport(_) | HttpClientError::Timeout)
        ));
    }

    #[tokio::test]
    async fn registry_reports_breaker_state() {
        let client = ResilientClient::builder()
            .name("product-service")
            .base_url("http://127.0.0.1:1")
            .build()
            .unwrap();
        let registry = ClientRegistry::new();
        registry.register(&client).await;

        let status = registry.status().await;
        assert_eq!(
            status["circuits"]["product-service"]["state"],
            "CLOSED"
        );
    }
}
