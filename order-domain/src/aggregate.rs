//! The `Order` aggregate: state, state machine, and the `sourcerer::Aggregate`
//! implementation that wires it into the event-sourcing framework.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sourcerer::{Aggregate, Snapshot, StoredEvent, async_trait};
use uuid::Uuid;

use crate::{
    commands::OrderCommand,
    error::OrderError,
    events::{OrderEvent, OrderItem},
};

/// The lifecycle status of an order.
///
/// `Uninitialized` is not one of the order lifecycle's four real states;
/// it represents the aggregate before any event has been applied (the
/// framework requires `Aggregate: Default`, and a "no events yet" sentinel
/// status is cheaper than wrapping every other field in `Option`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// No events have been applied yet.
    Uninitialized,
    /// The order has been created but not paid.
    Created,
    /// Payment has been received in full.
    Paid,
    /// The order has shipped. Terminal.
    Shipped,
    /// The order was cancelled. Terminal.
    Cancelled,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Created => "created",
            Self::Paid => "paid",
            Self::Shipped => "shipped",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A consistency boundary whose state is the fold of its event history.
///
/// `version` follows the numbering convention of the underlying
/// `sourcerer::EventStore` implementations (0 = no events persisted, the
/// Nth persisted event carries version N) rather than a zero-indexed
/// scheme with a `-1` pre-creation sentinel; the two are a one-off shift
/// of the same invariant (dense, strictly monotonic, unique per
/// aggregate) and are not distinguished anywhere observable — see
/// DESIGN.md for the rationale for keeping the store's convention rather
/// than forking the three `EventStore` backends to renumber.
#[derive(Debug, Clone, Default)]
pub struct Order {
    id: Uuid,
    customer_id: Uuid,
    total_amount: f64,
    shipping_address: String,
    items: Vec<OrderItem>,
    status: OrderStatusSlot,
    version: i64,
    payment_id: Option<Uuid>,
    payment_method: Option<String>,
    shipment_id: Option<Uuid>,
    tracking_number: Option<String>,
}

/// Wraps `OrderStatus` so `Order` can derive `Default` (the framework
/// requires `Aggregate: Default`) while defaulting to `Uninitialized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OrderStatusSlot(OrderStatus);

impl Default for OrderStatusSlot {
    fn default() -> Self {
        Self(OrderStatus::Uninitialized)
    }
}

impl Order {
    /// Creates a fresh, uninitialized aggregate bound to `id`. Used by the
    /// command handler before invoking a `Create` command, since `handle`
    /// takes `&self` and has no other way to learn the aggregate's
    /// identifier for a brand-new stream.
    #[must_use]
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// The order's current lifecycle status.
    #[must_use]
    pub fn status(&self) -> OrderStatus {
        self.status.0
    }

    /// The order's unique identifier.
    #[must_use]
    pub fn order_id(&self) -> Uuid {
        self.id
    }

    /// The customer who placed the order.
    #[must_use]
    pub fn customer_id(&self) -> Uuid {
        self.customer_id
    }

    /// Sum of `quantity * unit_price` across all items, fixed at creation.
    #[must_use]
    pub fn total_amount(&self) -> f64 {
        self.total_amount
    }

    /// The line items on the order.
    #[must_use]
    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }

    /// The destination shipping address.
    #[must_use]
    pub fn shipping_address(&self) -> &str {
        &self.shipping_address
    }

    /// The recorded payment identifier, if any.
    #[must_use]
    pub fn payment_id(&self) -> Option<Uuid> {
        self.payment_id
    }

    /// The recorded shipment identifier, if any.
    #[must_use]
    pub fn shipment_id(&self) -> Option<Uuid> {
        self.shipment_id
    }

    /// The recorded carrier tracking number, if any.
    #[must_use]
    pub fn tracking_number(&self) -> Option<&str> {
        self.tracking_number.as_deref()
    }

    /// Validates that a loaded event history is dense, strictly monotonic,
    /// and unique per aggregate, then folds it into a fresh `Order`.
    ///
    /// `starting` carries an optional `(snapshot, snapshot_version)` pair;
    /// when present, `events` must begin at `snapshot_version + 1` and the
    /// returned aggregate starts from the snapshot's state rather than
    /// `Order::default()`.
    ///
    /// # Errors
    ///
    /// Returns `OrderError::CorruptStream` if `events` has a gap, a
    /// duplicate version, a version that is not strictly increasing, or
    /// (when `starting` is supplied) does not begin immediately after the
    /// snapshot's version.
    pub fn rehydrate(
        aggregate_id: Uuid,
        starting: Option<(OrderSnapshot, i64)>,
        events: &[StoredEvent<OrderEvent>],
    ) -> Result<Self, OrderError> {
        let (mut order, mut expected_version) = match starting {
            Some((snapshot, snapshot_version)) => {
                (Self::from_snapshot(snapshot), snapshot_version)
            }
            None => (Self::default(), 0),
        };
        order.id = aggregate_id;

        for stored in events {
            expected_version += 1;
            if stored.version() != expected_version {
                return Err(OrderError::CorruptStream {
                    aggregate_id: aggregate_id.to_string(),
                    reason: format!(
                        "expected version {expected_version}, found {}",
                        stored.version()
                    ),
                });
            }
            order.apply(stored.event());
        }

        Ok(order)
    }

    /// Creates a new order. Fails `InvalidCommand` if `items` is empty.
    ///
    /// # Errors
    ///
    /// Returns `OrderError::InvalidCommand` if `items` is empty.
    pub fn create(
        customer_id: Uuid,
        items: Vec<OrderItem>,
        shipping_address: String,
    ) -> Result<OrderEvent, OrderError> {
        if items.is_empty() {
            return Err(OrderError::InvalidCommand(
                "an order must have at least one item".to_string(),
            ));
        }
        let total_amount = items.iter().map(OrderItem::line_total).sum();
        Ok(OrderEvent::Created {
            customer_id,
            items,
            total_amount,
            shipping_address,
            created_at: Utc::now(),
        })
    }

    /// Records payment for the order.
    ///
    /// # Errors
    ///
    /// Returns `OrderError::IllegalTransition` if the order is not
    /// currently `Created`, or `OrderError::InvalidCommand` if `amount`
    /// does not match the order's total (compared to the cent).
    pub fn mark_paid(
        &self,
        payment_id: Uuid,
        amount: f64,
        method: String,
    ) -> Result<OrderEvent, OrderError> {
        if self.status.0 != OrderStatus::Created {
            return Err(OrderError::IllegalTransition {
                current_status: self.status.0.to_string(),
                operation: "mark_paid".to_string(),
            });
        }
        let paid_cents = (amount * 100.0).round();
        let total_cents = (self.total_amount * 100.0).round();
        if paid_cents != total_cents {
            return Err(OrderError::InvalidCommand(format!(
                "payment amount {amount} does not match order total {}",
                self.total_amount
            )));
        }
        Ok(OrderEvent::Paid {
            payment_id,
            amount_paid: amount,
            payment_method: method,
            paid_at: Utc::now(),
        })
    }

    /// Ships a paid order.
    ///
    /// # Errors
    ///
    /// Returns `OrderError::IllegalTransition` if the order is not
    /// currently `Paid`.
    pub fn ship(&self, shipment_id: Uuid, tracking_number: String) -> Result<OrderEvent, OrderError> {
        if self.status.0 != OrderStatus::Paid {
            return Err(OrderError::IllegalTransition {
                current_status: self.status.0.to_string(),
                operation: "ship".to_string(),
            });
        }
        Ok(OrderEvent::Shipped {
            shipment_id,
            tracking_number,
            shipped_date: Utc::now(),
        })
    }

    /// Cancels the order.
    ///
    /// # Errors
    ///
    /// Returns `OrderError::IllegalTransition` if the order has already
    /// shipped or was already cancelled.
    pub fn cancel(&self, reason: String) -> Result<OrderEvent, OrderError> {
        match self.status.0 {
            OrderStatus::Shipped | OrderStatus::Cancelled => Err(OrderError::IllegalTransition {
                current_status: self.status.0.to_string(),
                operation: "cancel".to_string(),
            }),
            OrderStatus::Uninitialized => Err(OrderError::IllegalTransition {
                current_status: self.status.0.to_string(),
                operation: "cancel".to_string(),
            }),
            OrderStatus::Created | OrderStatus::Paid => {
                let refund_required = self.status.0 == OrderStatus::Paid;
                Ok(OrderEvent::Cancelled {
                    reason,
                    refund_required,
                    cancelled_at: Utc::now(),
                })
            }
        }
    }
}

#[async_trait]
impl Aggregate for Order {
    type Id = Uuid;
    type Event = OrderEvent;
    type Command = OrderCommand;
    type Snapshot = OrderSnapshot;
    type Error = OrderError;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OrderEvent::Created {
                customer_id,
                items,
                total_amount,
                shipping_address,
                ..
            } => {
                self.customer_id = *customer_id;
                self.items.clone_from(items);
                self.total_amount = *total_amount;
                self.shipping_address.clone_from(shipping_address);
                self.status = OrderStatusSlot(OrderStatus::Created);
            }
            OrderEvent::Paid {
                payment_id,
                payment_method,
                ..
            } => {
                self.payment_id = Some(*payment_id);
                self.payment_method = Some(payment_method.clone());
                self.status = OrderStatusSlot(OrderStatus::Paid);
            }
            OrderEvent::Shipped {
                shipment_id,
                tracking_number,
                ..
            } => {
                self.shipment_id = Some(*shipment_id);
                self.tracking_number = Some(tracking_number.clone());
                self.status = OrderStatusSlot(OrderStatus::Shipped);
            }
            OrderEvent::Cancelled { .. } => {
                self.status = OrderStatusSlot(OrderStatus::Cancelled);
            }
        }
        self.version += 1;
    }

    async fn handle(&self, command: Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        let event = match command {
            OrderCommand::Create {
                customer_id,
                items,
                shipping_address,
            } => Self::create(customer_id, items, shipping_address)?,
            OrderCommand::MarkPaid {
                payment_id,
                amount,
                method,
            } => self.mark_paid(payment_id, amount, method)?,
            OrderCommand::Ship {
                shipment_id,
                tracking_number,
            } => self.ship(shipment_id, tracking_number)?,
            OrderCommand::Cancel { reason } => self.cancel(reason)?,
        };
        Ok(vec![event])
    }

    fn from_snapshot(snapshot: Self::Snapshot) -> Self {
        Self {
            id: snapshot.id,
            customer_id: snapshot.customer_id,
            total_amount: snapshot.total_amount,
            shipping_address: snapshot.shipping_address,
            items: snapshot.items,
            status: OrderStatusSlot(snapshot.status),
            version: snapshot.version,
            payment_id: snapshot.payment_id,
            payment_method: snapshot.payment_method,
            shipment_id: snapshot.shipment_id,
            tracking_number: snapshot.tracking_number,
        }
    }

    fn snapshot(&self) -> Self::Snapshot {
        OrderSnapshot {
            schema_version: OrderSnapshot::CURRENT_SCHEMA_VERSION,
            version: self.version,
            id: self.id,
            customer_id: self.customer_id,
            total_amount: self.total_amount,
            shipping_address: self.shipping_address.clone(),
            items: self.items.clone(),
            status: self.status.0,
            payment_id: self.payment_id,
            payment_method: self.payment_method.clone(),
            shipment_id: self.shipment_id,
            tracking_number: self.tracking_number.clone(),
        }
    }
}

/// A cached materialization of `Order` state at a specific version.
///
/// Advisory only: the event stream is authoritative, and a snapshot store
/// may be wiped and rebuilt from nothing but events without changing
/// observable behavior. `schema_version` lets the snapshot's own shape
/// evolve independently of the event schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSnapshot {
    /// Version of the snapshot's own payload shape, not the event schema.
    pub schema_version: u16,
    /// The aggregate version this snapshot captures. Restored into
    /// `Order::version` by `from_snapshot` so replaying only the events
    /// after this version reconstructs the correct version number.
    pub version: i64,
    id: Uuid,
    customer_id: Uuid,
    total_amount: f64,
    shipping_address: String,
    items: Vec<OrderItem>,
    status: OrderStatus,
    payment_id: Option<Uuid>,
    payment_method: Option<String>,
    shipment_id: Option<Uuid>,
    tracking_number: Option<String>,
}

impl OrderSnapshot {
    /// The current snapshot payload schema version.
    pub const CURRENT_SCHEMA_VERSION: u16 = 1;
}

impl Snapshot for OrderSnapshot {}
