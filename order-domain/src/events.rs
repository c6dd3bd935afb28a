//! Event model for the `Order` aggregate.
//!
//! Each variant corresponds to exactly one domain state transition
//! (`Created`, `Paid`, `Shipped`, `Cancelled`). The set is closed: new
//! transitions require a new variant, not open inheritance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sourcerer_derive::Event;
use uuid::Uuid;

/// A single line item on an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    /// Identifier of the purchased product.
    pub product_id: Uuid,
    /// Human-readable product name, denormalized at order time.
    pub product_name: String,
    /// Quantity ordered. Must be at least 1.
    pub quantity: u32,
    /// Price per unit at the time of ordering. Must be non-negative.
    pub unit_price: f64,
}

impl OrderItem {
    /// Total price for this line item (`quantity * unit_price`).
    #[must_use]
    pub fn line_total(&self) -> f64 {
        f64::from(self.quantity) * self.unit_price
    }
}

/// An immutable fact about a state transition of one `Order` aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Event)]
#[event(version = 1, source = "urn:order-service:order")]
pub enum OrderEvent {
    /// The order was created with an initial set of items.
    Created {
        /// Customer who placed the order.
        customer_id: Uuid,
        /// Line items that make up the order.
        items: Vec<OrderItem>,
        /// Sum of `quantity * unit_price` across all items.
        total_amount: f64,
        /// Destination address for the shipment.
        shipping_address: String,
        /// Wall-clock time the order was created.
        created_at: DateTime<Utc>,
    },
    /// Payment was received for the order in full.
    Paid {
        /// Identifier of the payment transaction.
        payment_id: Uuid,
        /// Amount paid; must equal the order's `total_amount`.
        amount_paid: f64,
        /// Payment method used (e.g. "card", "wire").
        payment_method: String,
        /// Wall-clock time the payment was recorded.
        paid_at: DateTime<Utc>,
    },
    /// The order was handed off to a carrier.
    Shipped {
        /// Identifier of the shipment.
        shipment_id: Uuid,
        /// Carrier tracking number.
        tracking_number: String,
        /// Date the shipment left the warehouse.
        shipped_date: DateTime<Utc>,
    },
    /// The order was cancelled.
    Cancelled {
        /// Free-text reason for the cancellation.
        reason: String,
        /// Whether a refund is owed (true iff the order was `Paid`).
        refund_required: bool,
        /// Wall-clock time the cancellation was recorded.
        cancelled_at: DateTime<Utc>,
    },
}

impl OrderEvent {
    /// The wall-clock time this event occurred, regardless of variant.
    #[must_use]
    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            Self::Created { created_at, .. } => *created_at,
            Self::Paid { paid_at, .. } => *paid_at,
            Self::Shipped { shipped_date, .. } => *shipped_date,
            Self::Cancelled { cancelled_at, .. } => *cancelled_at,
        }
    }
}
