//! Commands the `Order` aggregate can handle.

use uuid::Uuid;

use crate::events::OrderItem;

/// The four operations a caller may request of an `Order` aggregate.
#[derive(Debug, Clone)]
pub enum OrderCommand {
    /// Create a new order. Fails `InvalidCommand` if `items` is empty.
    Create {
        /// Customer placing the order.
        customer_id: Uuid,
        /// Line items for the order.
        items: Vec<OrderItem>,
        /// Destination shipping address.
        shipping_address: String,
    },
    /// Record payment for the order.
    MarkPaid {
        /// Identifier of the payment transaction.
        payment_id: Uuid,
        /// Amount paid. Must equal the order's total.
        amount: f64,
        /// Payment method used.
        method: String,
    },
    /// Ship a paid order.
    Ship {
        /// Identifier of the shipment.
        shipment_id: Uuid,
        /// Carrier tracking number.
        tracking_number: String,
    },
    /// Cancel an order that has not shipped.
    Cancel {
        /// Free-text cancellation reason.
        reason: String,
    },
}
