//! Circuit breaker with a rolling error-rate window.
//!
//! A breaker monitors one downstream dependency and "opens" (rejects calls
//! immediately) when the error percentage over a rolling window crosses a
//! threshold, preventing cascading failures while the dependency is down.
//!
//! # States
//!
//! - **Closed**: calls pass through; outcomes are counted into the window.
//! - **Open**: calls are rejected without executing, until `reset_timeout`
//!   has elapsed.
//! - **HalfOpen**: a probe period. The first success closes the circuit;
//!   any failure reopens it.
//!
//! The trip condition is rate-based, not consecutive-failure-based: the
//! window is `rolling_window` wide, partitioned into `rolling_buckets`
//! buckets, and the breaker only trips once the window holds at least
//! `volume_threshold` calls. Low-traffic blips cannot open the circuit.
//!
//! # Example
//!
//! ```rust
//! use souk_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//!
//! # async fn example() {
//! let breaker = CircuitBreaker::new("product-service", CircuitBreakerConfig::default());
//!
//! match breaker.call(|| async { Ok::<_, String>(42) }).await {
//!     Ok(value) => println!("got {value}"),
//!     Err(e) => println!("failed: {e}"),
//! }
//! # }
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Error percentage (0–100) at which the circuit opens.
    pub error_threshold_pct: f64,
    /// Minimum calls in the window before the threshold applies.
    pub volume_threshold: u64,
    /// Width of the rolling window.
    pub rolling_window: Duration,
    /// Number of buckets the window is partitioned into.
    pub rolling_buckets: usize,
    /// Time in Open before probing with `HalfOpen`.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold_pct: 50.0,
            volume_threshold: 10,
            rolling_window: Duration::from_secs(10),
            rolling_buckets: 10,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder.
    #[must_use]
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    /// Set the error percentage (0–100) that opens the circuit.
    #[must_use]
    pub const fn error_threshold_pct(mut self, pct: f64) -> Self {
        self.config.error_threshold_pct = pct;
        self
    }

    /// Set the minimum call volume before the threshold applies.
    #[must_use]
    pub const fn volume_threshold(mut self, volume: u64) -> Self {
        self.config.volume_threshold = volume;
        self
    }

    /// Set the rolling window width.
    #[must_use]
    pub const fn rolling_window(mut self, window: Duration) -> Self {
        self.config.rolling_window = window;
        self
    }

    /// Set the number of window buckets.
    #[must_use]
    pub const fn rolling_buckets(mut self, buckets: usize) -> Self {
        self.config.rolling_buckets = buckets;
        self
    }

    /// Set the Open → `HalfOpen` cooldown.
    #[must_use]
    pub const fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout = timeout;
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            rolling_buckets: self.config.rolling_buckets.max(1),
            ..self.config
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// Calls pass through normally.
    Closed,
    /// Calls are rejected immediately.
    Open,
    /// Probing whether the dependency recovered.
    HalfOpen,
}

/// Errors from breaker-wrapped operations.
#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    /// The circuit is open; the operation was not executed.
    #[error("circuit breaker is open")]
    Open {
        /// Time until the next probe is allowed.
        retry_after: Duration,
    },
    /// The operation ran and failed.
    #[error("operation failed: {0}")]
    Inner(E),
}

/// One bucket of the rolling window.
#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    successes: u64,
    failures: u64,
}

/// Mutable breaker state behind the lock.
#[derive(Debug)]
struct Inner {
    state: State,
    buckets: Vec<Bucket>,
    /// Index of the bucket currently being written.
    head: usize,
    /// When the head bucket started.
    head_started: Instant,
    /// When the circuit last opened.
    opened_at: Option<Instant>,
}

impl Inner {
    fn new(buckets: usize) -> Self {
        Self {
            state: State::Closed,
            buckets: vec![Bucket::default(); buckets],
            head: 0,
            head_started: Instant::now(),
            opened_at: None,
        }
    }

    /// Rotate the window so the head bucket covers `now`.
    #[allow(clippy::cast_possible_truncation)] // steps is bounded by bucket count below
    fn advance(&mut self, now: Instant, bucket_width: Duration) {
        if bucket_width.is_zero() {
            return;
        }
        let elapsed = now.saturating_duration_since(self.head_started);
        let steps = (elapsed.as_nanos() / bucket_width.as_nanos().max(1)) as u64;
        if steps == 0 {
            return;
        }
        if steps >= self.buckets.len() as u64 {
            // The whole window aged out.
            self.buckets.fill(Bucket::default());
            self.head_started = now;
        } else {
            for _ in 0..steps {
                self.head = (self.head + 1) % self.buckets.len();
                self.buckets[self.head] = Bucket::default();
            }
            self.head_started += bucket_width * (steps as u32);
        }
    }

    fn window_totals(&self) -> (u64, u64) {
        self.buckets.iter().fold((0, 0), |(ok, err), bucket| {
            (ok + bucket.successes, err + bucket.failures)
        })
    }

    fn error_pct(&self) -> f64 {
        let (successes, failures) = self.window_totals();
        let total = successes + failures;
        if total == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            failures as f64 / total as f64 * 100.0
        }
    }

    fn reset_window(&mut self) {
        self.buckets.fill(Bucket::default());
        self.head = 0;
        self.head_started = Instant::now();
    }
}

/// Rolling-window circuit breaker for one downstream dependency.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    inner: Arc<RwLock<Inner>>,
    total_calls: Arc<AtomicU64>,
    total_successes: Arc<AtomicU64>,
    total_failures: Arc<AtomicU64>,
    total_rejections: Arc<AtomicU64>,
}

impl CircuitBreaker {
    /// Create a breaker for a named dependency.
    #[must_use]
    pub fn new(name: &str, config: CircuitBreakerConfig) -> Self {
        let buckets = config.rolling_buckets.max(1);
        Self {
            name: Arc::from(name),
            config: Arc::new(config),
            inner: Arc::new(RwLock::new(Inner::new(buckets))),
            total_calls: Arc::new(AtomicU64::new(0)),
            total_successes: Arc::new(AtomicU64::new(0)),
            total_failures: Arc::new(AtomicU64::new(0)),
            total_rejections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Dependency name this breaker guards.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    pub async fn state(&self) -> State {
        self.inner.read().await.state
    }

    /// Execute an operation through the breaker.
    ///
    /// # Errors
    ///
    /// [`CircuitBreakerError::Open`] when the circuit rejects the call,
    /// [`CircuitBreakerError::Inner`] when the operation itself fails.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        if let Some(retry_after) = self.rejection_cooldown().await {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("circuit_breaker.rejected", "circuit" => self.name.to_string())
                .increment(1);
            tracing::warn!(circuit = %self.name, "Circuit breaker is OPEN, rejecting call");
            return Err(CircuitBreakerError::Open { retry_after });
        }

        match operation().await {
            Ok(value) => {
                self.on_success().await;
                self.total_successes.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                self.on_failure().await;
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    /// `None` when a call may proceed; otherwise the remaining cooldown.
    async fn rejection_cooldown(&self) -> Option<Duration> {
        let mut inner = self.inner.write().await;
        match inner.state {
            State::Closed | State::HalfOpen => None,
            State::Open => {
                let opened_at = inner.opened_at?;
                let elapsed = opened_at.elapsed();
                if elapsed >= self.config.reset_timeout {
                    tracing::info!(circuit = %self.name, "Circuit breaker transitioning OPEN -> HALF_OPEN");
                    inner.state = State::HalfOpen;
                    None
                } else {
                    Some(self.config.reset_timeout - elapsed)
                }
            }
        }
    }

    fn bucket_width(&self) -> Duration {
        self.config.rolling_window / u32::try_from(self.config.rolling_buckets.max(1)).unwrap_or(1)
    }

    async fn on_success(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            State::Closed => {
                let width = self.bucket_width();
                inner.advance(Instant::now(), width);
                let head = inner.head;
                inner.buckets[head].successes += 1;
            }
            State::HalfOpen => {
                tracing::info!(circuit = %self.name, "Circuit breaker transitioning HALF_OPEN -> CLOSED");
                inner.state = State::Closed;
                inner.opened_at = None;
                inner.reset_window();
            }
            State::Open => {}
        }
    }

    async fn on_failure(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            State::Closed => {
                let width = self.bucket_width();
                inner.advance(Instant::now(), width);
                let head = inner.head;
                inner.buckets[head].failures += 1;

                let (successes, failures) = inner.window_totals();
                let volume = successes + failures;
                if volume >= self.config.volume_threshold
                    && inner.error_pct() >= self.config.error_threshold_pct
                {
                    tracing::warn!(
                        circuit = %self.name,
                        volume,
                        error_pct = inner.error_pct(),
                        threshold = self.config.error_threshold_pct,
                        "Circuit breaker transitioning CLOSED -> OPEN"
                    );
                    inner.state = State::Open;
                    inner.opened_at = Some(Instant::now());
                    metrics::counter!("circuit_breaker.opened", "circuit" => self.name.to_string())
                        .increment(1);
                }
            }
            State::HalfOpen => {
                tracing::warn!(circuit = %self.name, "Circuit breaker transitioning HALF_OPEN -> OPEN (probe failed)");
                inner.state = State::Open;
                inner.opened_at = Some(Instant::now());
            }
            State::Open => {}
        }
    }

    /// Point-in-time snapshot for the status endpoint.
    pub async fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.read().await;
        let (window_successes, window_failures) = inner.window_totals();
        CircuitBreakerSnapshot {
            state: inner.state,
            window_successes,
            window_failures,
            window_error_pct: inner.error_pct(),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Force the breaker back to Closed (tests, manual intervention).
    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        tracing::info!(circuit = %self.name, "Circuit breaker manually reset to CLOSED");
        inner.state = State::Closed;
        inner.opened_at = None;
        inner.reset_window();
    }
}

/// Serializable breaker status.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CircuitBreakerSnapshot {
    /// Current state.
    pub state: State,
    /// Successes inside the rolling window.
    pub window_successes: u64,
    /// Failures inside the rolling window.
    pub window_failures: u64,
    /// Error percentage over the window.
    pub window_error_pct: f64,
    /// Calls attempted since construction.
    pub total_calls: u64,
    /// Successful calls since construction.
    pub total_successes: u64,
    /// Failed calls since construction.
    pub total_failures: u64,
    /// Calls rejected while open.
    pub total_rejections: u64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn trippy_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig::builder()
            .volume_threshold(4)
            .error_threshold_pct(50.0)
            .rolling_window(Duration::from_secs(10))
            .rolling_buckets(10)
            .reset_timeout(Duration::from_millis(100))
            .build()
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker.call(|| async { Err::<(), _>("boom") }).await;
    }

    async fn succeed(breaker: &CircuitBreaker) {
        let _ = breaker.call(|| async { Ok::<_, String>(()) }).await;
    }

    #[tokio::test]
    async fn stays_closed_below_volume_threshold() {
        let breaker = CircuitBreaker::new("dep", trippy_config());
        // 3 failures: 100% errors but below the volume threshold of 4.
        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state().await, State::Closed);
    }

    #[tokio::test]
    async fn opens_when_error_rate_crosses_threshold() {
        let breaker = CircuitBreaker::new("dep", trippy_config());
        succeed(&breaker).await;
        succeed(&breaker).await;
        fail(&breaker).await;
        // 1/3 errors, volume 3: still closed.
        assert_eq!(breaker.state().await, State::Closed);
        fail(&breaker).await;
        // 2/4 = 50% at volume 4: opens.
        assert_eq!(breaker.state().await, State::Open);
    }

    #[tokio::test]
    async fn rejects_while_open_with_cooldown() {
        let breaker = CircuitBreaker::new("dep", trippy_config());
        for _ in 0..4 {
            fail(&breaker).await;
        }
        let result = breaker.call(|| async { Ok::<_, String>(1) }).await;
        match result {
            Err(CircuitBreakerError::Open { retry_after }) => {
                assert!(retry_after <= Duration::from_millis(100));
            }
            _ => panic!("expected rejection"),
        }
        assert_eq!(breaker.snapshot().await.total_rejections, 1);
    }

    #[tokio::test]
    async fn half_open_closes_on_first_success() {
        let breaker = CircuitBreaker::new("dep", trippy_config());
        for _ in 0..4 {
            fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        succeed(&breaker).await;
        assert_eq!(breaker.state().await, State::Closed);
        // The window was cleared: old failures do not linger.
        let snapshot = breaker.snapshot().await;
        assert_eq!(snapshot.window_failures, 0);
    }

    #[tokio::test]
    async fn half_open_reopens_on_failure() {
        let breaker = CircuitBreaker::new("dep", trippy_config());
        for _ in 0..4 {
            fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        fail(&breaker).await;
        assert_eq!(breaker.state().await, State::Open);
    }

    #[tokio::test]
    async fn window_ages_out_old_outcomes() {
        let config = CircuitBreakerConfig::builder()
            .volume_threshold(4)
            .rolling_window(Duration::from_millis(100))
            .rolling_buckets(2)
            .build();
        let breaker = CircuitBreaker::new("dep", config);
        fail(&breaker).await;
        fail(&breaker).await;
        fail(&breaker).await;
        // Let the whole window expire; the three failures vanish.
        tokio::time::sleep(Duration::from_millis(250)).await;
        fail(&breaker).await;
        assert_eq!(breaker.state().await, State::Closed);
        assert_eq!(breaker.snapshot().await.window_failures, 1);
    }

    #[tokio::test]
    async fn reset_closes_the_circuit() {
        let breaker = CircuitBreaker::new("dep", trippy_config());
        for _ in 0..4 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state().await, State::Open);
        breaker.reset().await;
        assert_eq!(breaker.state().await, State::Closed);
    }

    #[tokio::test]
    async fn snapshot_counts_totals() {
        let breaker = CircuitBreaker::new("dep", CircuitBreakerConfig::default());
        succeed(&breaker).await;
        succeed(&breaker).await;
        fail(&breaker).await;
        let snapshot = breaker.snapshot().await;
        assert_eq!(snapshot.total_calls, 3);
        assert_eq!(snapshot.total_successes, 2);
        assert_eq!(snapshot.total_failures, 1);
    }
}
