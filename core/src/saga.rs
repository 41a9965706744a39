//! Order saga state machine.
//!
//! The machine is a pure function over `(status, trigger)`; persisting the
//! new status and emitting follow-on events is the handler's job, inside a
//! single store transaction. Keeping the transition logic side-effect free
//! is what lets the idempotency rules be tested exhaustively.
//!
//! Legal transitions:
//!
//! | From      | To        | Trigger                      |
//! |-----------|-----------|------------------------------|
//! | PENDING   | CONFIRMED | `inventory.reserved.success` |
//! | PENDING   | CANCELLED | `inventory.reserved.failed`  |
//! | CONFIRMED | PAID      | `payment.succeeded`          |
//! | CONFIRMED | CANCELLED | `payment.failed`             |
//!
//! PENDING→PAID does not exist: payment must never run before inventory is
//! reserved. Deliveries can arrive out of order or twice; the source-state
//! requirements make every illegal interleaving a detectable no-op instead
//! of a corruption.

use crate::order::OrderStatus;
use thiserror::Error;

/// Saga triggers, one per inbound event the order service consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaTrigger {
    /// `inventory.reserved.success`
    InventoryReserved,
    /// `inventory.reserved.failed`
    InventoryFailed,
    /// `payment.succeeded`
    PaymentSucceeded,
    /// `payment.failed` or `order.timeout`
    PaymentFailed,
}

impl SagaTrigger {
    /// The state this trigger moves an order into.
    #[must_use]
    pub const fn target(self) -> OrderStatus {
        match self {
            Self::InventoryReserved => OrderStatus::Confirmed,
            Self::PaymentSucceeded => OrderStatus::Paid,
            Self::InventoryFailed | Self::PaymentFailed => OrderStatus::Cancelled,
        }
    }

    /// The only state this trigger may fire from.
    #[must_use]
    pub const fn required_source(self) -> OrderStatus {
        match self {
            Self::InventoryReserved | Self::InventoryFailed => OrderStatus::Pending,
            Self::PaymentSucceeded | Self::PaymentFailed => OrderStatus::Confirmed,
        }
    }
}

/// Why a trigger did not produce a transition.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError {
    /// The order already sits in the trigger's target state: a duplicate
    /// delivery. Handlers ack this as success without re-emitting anything.
    #[error("order is already {target:?}")]
    AlreadyInTarget {
        /// The state both the order and the trigger point at.
        target: OrderStatus,
    },

    /// The order is in a terminal state the trigger cannot leave: a stale
    /// delivery (for example `inventory.reserved.success` after the order
    /// was cancelled by another line's failure). Handlers ack with a
    /// warning; the reserved-success case additionally compensates.
    #[error("order is terminally {current:?}, ignoring trigger toward {target:?}")]
    Stale {
        /// Terminal state the order is in.
        current: OrderStatus,
        /// Where the trigger wanted to go.
        target: OrderStatus,
    },

    /// The ordering contract is broken (e.g. `payment.succeeded` on a
    /// PENDING order). Deterministic, routed to the DLQ.
    #[error("illegal transition {current:?} -> {target:?}")]
    Illegal {
        /// State the order is in.
        current: OrderStatus,
        /// Where the trigger wanted to go.
        target: OrderStatus,
    },
}

/// Apply a trigger to a status.
///
/// Returns the new status, or a classified reason why nothing happened.
///
/// # Errors
///
/// [`TransitionError::AlreadyInTarget`] and [`TransitionError::Stale`] are
/// idempotent no-ops; [`TransitionError::Illegal`] is a contract violation.
pub fn apply(current: OrderStatus, trigger: SagaTrigger) -> Result<OrderStatus, TransitionError> {
    let target = trigger.target();

    if current == target {
        return Err(TransitionError::AlreadyInTarget { target });
    }
    if current.is_terminal() {
        return Err(TransitionError::Stale { current, target });
    }
    if current == trigger.required_source() {
        Ok(target)
    } else {
        Err(TransitionError::Illegal { current, target })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn the_four_legal_transitions() {
        assert_eq!(
            apply(OrderStatus::Pending, SagaTrigger::InventoryReserved).unwrap(),
            OrderStatus::Confirmed
        );
        assert_eq!(
            apply(OrderStatus::Pending, SagaTrigger::InventoryFailed).unwrap(),
            OrderStatus::Cancelled
        );
        assert_eq!(
            apply(OrderStatus::Confirmed, SagaTrigger::PaymentSucceeded).unwrap(),
            OrderStatus::Paid
        );
        assert_eq!(
            apply(OrderStatus::Confirmed, SagaTrigger::PaymentFailed).unwrap(),
            OrderStatus::Cancelled
        );
    }

    #[test]
    fn pending_to_paid_is_forbidden() {
        assert_eq!(
            apply(OrderStatus::Pending, SagaTrigger::PaymentSucceeded),
            Err(TransitionError::Illegal {
                current: OrderStatus::Pending,
                target: OrderStatus::Paid,
            })
        );
    }

    #[test]
    fn duplicate_trigger_is_already_in_target() {
        assert_eq!(
            apply(OrderStatus::Confirmed, SagaTrigger::InventoryReserved),
            Err(TransitionError::AlreadyInTarget {
                target: OrderStatus::Confirmed
            })
        );
        assert_eq!(
            apply(OrderStatus::Cancelled, SagaTrigger::PaymentFailed),
            Err(TransitionError::AlreadyInTarget {
                target: OrderStatus::Cancelled
            })
        );
    }

    #[test]
    fn reserved_success_after_cancellation_is_stale() {
        assert_eq!(
            apply(OrderStatus::Cancelled, SagaTrigger::InventoryReserved),
            Err(TransitionError::Stale {
                current: OrderStatus::Cancelled,
                target: OrderStatus::Confirmed,
            })
        );
    }

    #[test]
    fn paid_is_final() {
        for trigger in [
            SagaTrigger::InventoryReserved,
            SagaTrigger::InventoryFailed,
            SagaTrigger::PaymentFailed,
        ] {
            assert!(matches!(
                apply(OrderStatus::Paid, trigger),
                Err(TransitionError::Stale { .. })
            ));
        }
    }

    fn arb_trigger() -> impl Strategy<Value = SagaTrigger> {
        prop_oneof![
            Just(SagaTrigger::InventoryReserved),
            Just(SagaTrigger::InventoryFailed),
            Just(SagaTrigger::PaymentSucceeded),
            Just(SagaTrigger::PaymentFailed),
        ]
    }

    proptest! {
        /// Any sequence of triggers applied from PENDING only ever reaches
        /// states on a legal path, and terminal states never change.
        #[test]
        fn reachability_under_arbitrary_sequences(
            triggers in prop::collection::vec(arb_trigger(), 0..16)
        ) {
            let mut status = OrderStatus::Pending;
            for trigger in triggers {
                match apply(status, trigger) {
                    Ok(next) => {
                        // Every accepted step is one of the four arcs.
                        prop_assert!(matches!(
                            (status, next),
                            (OrderStatus::Pending, OrderStatus::Confirmed)
                                | (OrderStatus::Pending, OrderStatus::Cancelled)
                                | (OrderStatus::Confirmed, OrderStatus::Paid)
                                | (OrderStatus::Confirmed, OrderStatus::Cancelled)
                        ));
                        status = next;
                    }
                    Err(_) => {
                        // Rejected triggers leave the status untouched.
                    }
                }
            }
        }

        /// Applying the same trigger twice in a row never changes state the
        /// second time.
        #[test]
        fn triggers_are_idempotent(trigger in arb_trigger()) {
            let mut status = OrderStatus::Pending;
            if let Ok(next) = apply(status, trigger) {
                status = next;
            }
            let after_first = status;
            if let Ok(next) = apply(status, trigger) {
                status = next;
            }
            prop_assert_eq!(status, after_first);
        }
    }
}
