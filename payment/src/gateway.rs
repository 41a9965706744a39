//! Payment gateway abstraction.
//!
//! In production this seam fronts a real processor; the mock implementation
//! charges everything except user ids carrying the configured decline
//! marker, which end-to-end tests use to force the compensation path.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Gateway failures, split by what the saga should do next.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The processor rejected the charge. Deterministic: emit
    /// `payment.failed`.
    #[error("charge declined: {0}")]
    Declined(String),

    /// The processor could not be reached in time. Retryable.
    #[error("gateway timeout")]
    Timeout,

    /// The processor is down. Retryable.
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

impl GatewayError {
    /// Whether the charge may be retried (the processor never saw it or
    /// answered indeterminately).
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable(_))
    }
}

/// A completed charge.
#[derive(Debug, Clone)]
pub struct ChargeReceipt {
    /// Processor-side transaction identifier.
    pub transaction_id: String,
}

/// Payment processor seam.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Charge `amount_cents` for an order.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Declined`] for deterministic rejections; the
    /// retryable variants for infrastructure failures.
    async fn charge(
        &self,
        order_id: Uuid,
        user_id: &str,
        amount_cents: i64,
        currency: &str,
    ) -> Result<ChargeReceipt, GatewayError>;
}

/// Development gateway: succeeds unless the user id carries the decline
/// marker.
pub struct MockPaymentGateway {
    decline_marker: String,
}

impl MockPaymentGateway {
    /// Create the mock with its decline marker.
    #[must_use]
    pub const fn new(decline_marker: String) -> Self {
        Self { decline_marker }
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn charge(
        &self,
        order_id: Uuid,
        user_id: &str,
        amount_cents: i64,
        currency: &str,
    ) -> Result<ChargeReceipt, GatewayError> {
        // Simulated processor latency.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        if !self.decline_marker.is_empty() && user_id.contains(&self.decline_marker) {
            return Err(GatewayError::Declined("card declined".to_string()));
        }

        let transaction_id = format!("txn_{}", Uuid::new_v4().simple());
        tracing::info!(
            order_id = %order_id,
            amount_cents,
            currency,
            transaction_id = %transaction_id,
            "Mock charge captured"
        );
        Ok(ChargeReceipt { transaction_id })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_charges_ordinary_users() {
        let gateway = MockPaymentGateway::new("payment-fail".into());
        let receipt = gateway
            .charge(Uuid::new_v4(), "user-1", 1000, "USD")
            .await
            .unwrap();
        assert!(receipt.transaction_id.starts_with("txn_"));
    }

    #[tokio::test]
    async fn mock_declines_marked_users() {
        let gateway = MockPaymentGateway::new("payment-fail".into());
        let result = gateway
            .charge(Uuid::new_v4(), "user-payment-fail-7", 1000, "USD")
            .await;
        assert!(matches!(result, Err(GatewayError::Declined(_))));
    }

    #[test]
    fn retryability_split() {
        assert!(GatewayError::Timeout.is_retryable());
        assert!(GatewayError::Unavailable("down".into()).is_retryable());
        assert!(!GatewayError::Declined("no funds".into()).is_retryable());
    }
}
