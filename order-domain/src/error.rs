//! The domain-level error taxonomy for the `Order` aggregate.
//!
//! These are the three kinds from the error taxonomy that originate in the
//! domain layer itself; `NotFound`, `ConcurrencyConflict` and `PublishError`
//! are infrastructure-level and live in `sourcerer::Error` and
//! `order-publisher` respectively.

/// Errors the `Order` aggregate's domain operations can return.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum OrderError {
    /// A command's arguments violate a domain invariant (e.g. an empty item
    /// list, or a payment amount that doesn't match the order total).
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// The command is not valid given the order's current status.
    #[error("illegal transition: cannot {operation} while order is {current_status}")]
    IllegalTransition {
        /// The order's status at the time of the attempted transition.
        current_status: String,
        /// The operation that was rejected.
        operation: String,
    },

    /// A supplied event history has non-dense or non-monotonic versions and
    /// cannot be safely replayed.
    #[error("corrupt event stream for aggregate {aggregate_id}: {reason}")]
    CorruptStream {
        /// The aggregate whose history failed validation.
        aggregate_id: String,
        /// Human-readable description of the violation.
        reason: String,
    },
}
