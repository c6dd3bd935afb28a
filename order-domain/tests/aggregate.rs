//! State machine, rehydration and end-to-end scenario tests for `Order`:
//! version density, monotone status, rehydration fidelity, and the
//! create-pay-ship, mismatched-payment, ship-before-pay, and
//! cancel-after-pay scenarios.

use order_domain::{Order, OrderError, OrderEvent, OrderItem, OrderStatus};
use sourcerer::{Aggregate, StoredEvent};
use uuid::Uuid;

fn item(quantity: u32, unit_price: f64) -> OrderItem {
    OrderItem {
        product_id: Uuid::new_v4(),
        product_name: "widget".to_string(),
        quantity,
        unit_price,
    }
}

fn stored(aggregate_id: Uuid, version: i64, event: OrderEvent) -> StoredEvent<OrderEvent> {
    StoredEvent::new(
        aggregate_id.to_string(),
        version,
        event.event_version(),
        event.event_type().to_string(),
        event,
    )
}

use sourcerer::Event as _;

#[test]
fn scenario_1_create_pay_ship_happy_path() {
    let id = Uuid::new_v4();
    let mut order = Order::new(id);

    let created = Order::create(
        Uuid::new_v4(),
        vec![item(2, 10.00)],
        "A".to_string(),
    )
    .expect("create should succeed");
    order.apply(&created);
    assert_eq!(order.version(), 1);
    assert_eq!(order.status(), OrderStatus::Created);
    assert_eq!(order.total_amount(), 20.00);

    let paid = order
        .mark_paid(Uuid::new_v4(), 20.00, "card".to_string())
        .expect("pay should succeed");
    order.apply(&paid);
    assert_eq!(order.version(), 2);
    assert_eq!(order.status(), OrderStatus::Paid);

    let shipped = order
        .ship(Uuid::new_v4(), "TRK-1".to_string())
        .expect("ship should succeed");
    order.apply(&shipped);
    assert_eq!(order.version(), 3);
    assert_eq!(order.status(), OrderStatus::Shipped);
    assert_eq!(order.tracking_number(), Some("TRK-1"));
}

#[test]
fn scenario_2_pay_amount_mismatch() {
    let id = Uuid::new_v4();
    let mut order = Order::new(id);
    let created = Order::create(Uuid::new_v4(), vec![item(1, 15.00)], "A".to_string()).unwrap();
    order.apply(&created);

    let err = order
        .mark_paid(Uuid::new_v4(), 14.99, "card".to_string())
        .expect_err("mismatched amount should fail");
    assert!(matches!(err, OrderError::InvalidCommand(_)));
    assert_eq!(order.status(), OrderStatus::Created, "status must not change");
}

#[test]
fn scenario_3_ship_before_pay() {
    let id = Uuid::new_v4();
    let mut order = Order::new(id);
    let created = Order::create(Uuid::new_v4(), vec![item(1, 15.00)], "A".to_string()).unwrap();
    order.apply(&created);

    let err = order
        .ship(Uuid::new_v4(), "TRK-1".to_string())
        .expect_err("shipping before paying should fail");
    assert!(matches!(err, OrderError::IllegalTransition { .. }));
    assert_eq!(order.version(), 1, "only Created should be persisted");
}

#[test]
fn scenario_4_cancel_after_pay_requires_refund() {
    let id = Uuid::new_v4();
    let mut order = Order::new(id);
    let created = Order::create(Uuid::new_v4(), vec![item(1, 15.00)], "A".to_string()).unwrap();
    order.apply(&created);
    let paid = order
        .mark_paid(Uuid::new_v4(), 15.00, "card".to_string())
        .unwrap();
    order.apply(&paid);

    let cancelled = order
        .cancel("fraud".to_string())
        .expect("cancel after pay should succeed");
    match &cancelled {
        OrderEvent::Cancelled {
            refund_required,
            reason,
            ..
        } => {
            assert!(*refund_required, "refund must be required after payment");
            assert_eq!(reason, "fraud");
        }
        other => panic!("expected Cancelled event, got {other:?}"),
    }
    order.apply(&cancelled);
    assert_eq!(order.status(), OrderStatus::Cancelled);
}

#[test]
fn create_fails_on_empty_items() {
    let err = Order::create(Uuid::new_v4(), vec![], "A".to_string())
        .expect_err("empty items should be rejected");
    assert!(matches!(err, OrderError::InvalidCommand(_)));
}

#[test]
fn cancel_terminal_states_are_illegal() {
    let id = Uuid::new_v4();
    let mut order = Order::new(id);
    let created = Order::create(Uuid::new_v4(), vec![item(1, 10.0)], "A".to_string()).unwrap();
    order.apply(&created);
    let paid = order
        .mark_paid(Uuid::new_v4(), 10.0, "card".to_string())
        .unwrap();
    order.apply(&paid);
    let shipped = order.ship(Uuid::new_v4(), "TRK".to_string()).unwrap();
    order.apply(&shipped);

    let err = order
        .cancel("too late".to_string())
        .expect_err("cancelling a shipped order must fail");
    assert!(matches!(err, OrderError::IllegalTransition { .. }));
}

#[test]
fn rehydration_fidelity_matches_sequential_apply() {
    let id = Uuid::new_v4();
    let created = Order::create(Uuid::new_v4(), vec![item(2, 10.0)], "A".to_string()).unwrap();
    let mut sequential = Order::new(id);
    sequential.apply(&created);
    let paid = sequential
        .mark_paid(Uuid::new_v4(), 20.0, "card".to_string())
        .unwrap();
    sequential.apply(&paid);

    let history = vec![stored(id, 1, created), stored(id, 2, paid)];
    let replayed = Order::rehydrate(id, None, &history).expect("history should replay");

    assert_eq!(replayed.version(), sequential.version());
    assert_eq!(replayed.status(), sequential.status());
    assert_eq!(replayed.total_amount(), sequential.total_amount());
}

#[test]
fn version_density_violation_is_corrupt_stream() {
    let id = Uuid::new_v4();
    let created = Order::create(Uuid::new_v4(), vec![item(1, 10.0)], "A".to_string()).unwrap();
    let mut source = Order::new(id);
    source.apply(&created.clone());
    let paid = source
        .mark_paid(Uuid::new_v4(), 10.0, "card".to_string())
        .expect("order is Created, pay should succeed");

    // Skip straight to version 3, leaving a gap at version 2.
    let history = vec![stored(id, 1, created), stored(id, 3, paid)];
    let err = Order::rehydrate(id, None, &history).expect_err("gap should be rejected");
    assert!(matches!(err, OrderError::CorruptStream { .. }));
}

#[test]
fn version_monotonicity_violation_is_corrupt_stream() {
    let id = Uuid::new_v4();
    let created = Order::create(Uuid::new_v4(), vec![item(1, 10.0)], "A".to_string()).unwrap();
    let created_again = created.clone();

    // Duplicate version 1 twice instead of advancing to 2.
    let history = vec![stored(id, 1, created), stored(id, 1, created_again)];
    let err = Order::rehydrate(id, None, &history).expect_err("duplicate version should be rejected");
    assert!(matches!(err, OrderError::CorruptStream { .. }));
}
