//! Handler error taxonomy.
//!
//! Every brokered delivery terminates in exactly one of three ways: ack
//! (success or recognized no-op), nack-with-requeue (transient), or
//! nack-to-DLQ (permanent). Handlers express which one they want by the
//! error variant they return; the consumer pipeline owns the actual
//! ack/nack calls.

use thiserror::Error;

/// Why a handler could not (fully) process a delivery.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Retryable infrastructure failure: broker/store disconnect, timeout,
    /// connection refused, an open circuit. The delivery is requeued.
    #[error("transient: {0}")]
    Transient(String),

    /// Deterministic failure: validation, invariant violation, schema
    /// mismatch, unexpected payload. Retrying cannot help; the delivery is
    /// routed to the dead-letter queue.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl HandlerError {
    /// True when the consumer should requeue the delivery.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Transient error from anything displayable.
    pub fn transient(err: impl std::fmt::Display) -> Self {
        Self::Transient(err.to_string())
    }

    /// Permanent error from anything displayable.
    pub fn permanent(err: impl std::fmt::Display) -> Self {
        Self::Permanent(err.to_string())
    }
}

/// What a handler accomplished, for successful terminations.
///
/// The distinction only matters for logging: every outcome acknowledges the
/// delivery and sets the processed-event marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// State changed (or follow-on events were enqueued).
    Applied,
    /// The event had already taken effect; nothing to do. Covers saga
    /// triggers arriving in the already-reached target state.
    NoopAlreadyApplied,
    /// The trigger was stale: the aggregate is in a terminal state the
    /// trigger cannot leave. Acked with a warning.
    NoopStale,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(HandlerError::Transient("timeout".into()).is_transient());
        assert!(!HandlerError::Permanent("bad payload".into()).is_transient());
    }

    #[test]
    fn constructors_capture_display() {
        let err = HandlerError::transient(std::io::Error::other("reset"));
        assert!(matches!(err, HandlerError::Transient(ref m) if m == "reset"));
    }
}
