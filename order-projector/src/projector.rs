//! Applies decoded events to the read model, enforcing idempotence by
//! `(aggregate_id, version)` and parking events that arrive ahead of
//! their predecessor.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use order_domain::OrderItem;
use order_readmodel::{ApplyOutcome, ReadModelError, ReadModelStore};
use sourcerer::Event as _;
use tracing::{error, instrument};
use uuid::Uuid;

use crate::envelope::{DecodedEnvelope, decode};
use crate::error::ProjectionError;

/// The subset of `order_readmodel::ReadModelStore`'s API the projector
/// depends on.
///
/// Exists so `Projector` can be tested against an in-memory fake instead
/// of a real Postgres instance; `ReadModelStore` is the only production
/// implementation.
#[async_trait]
pub trait ReadModelSink: Send + Sync {
    /// See `ReadModelStore::apply_created`.
    async fn apply_created(
        &self,
        order_id: Uuid,
        version: i64,
        customer_id: Uuid,
        items: &[OrderItem],
        total_amount: f64,
        shipping_address: &str,
        created_at: DateTime<Utc>,
    ) -> Result<ApplyOutcome, ReadModelError>;

    /// See `ReadModelStore::apply_paid`.
    async fn apply_paid(
        &self,
        order_id: Uuid,
        version: i64,
        payment_id: Uuid,
        payment_method: &str,
        paid_at: DateTime<Utc>,
    ) -> Result<ApplyOutcome, ReadModelError>;

    /// See `ReadModelStore::apply_shipped`.
    async fn apply_shipped(
        &self,
        order_id: Uuid,
        version: i64,
        shipment_id: Uuid,
        tracking_number: &str,
        shipped_at: DateTime<Utc>,
    ) -> Result<ApplyOutcome, ReadModelError>;

    /// See `ReadModelStore::apply_cancelled`.
    async fn apply_cancelled(
        &self,
        order_id: Uuid,
        version: i64,
        reason: &str,
        cancelled_at: DateTime<Utc>,
    ) -> Result<ApplyOutcome, ReadModelError>;
}

#[async_trait]
impl ReadModelSink for ReadModelStore {
    async fn apply_created(
        &self,
        order_id: Uuid,
        version: i64,
        customer_id: Uuid,
        items: &[OrderItem],
        total_amount: f64,
        shipping_address: &str,
        created_at: DateTime<Utc>,
    ) -> Result<ApplyOutcome, ReadModelError> {
        ReadModelStore::apply_created(
            self,
            order_id,
            version,
            customer_id,
            items,
            total_amount,
            shipping_address,
            created_at,
        )
        .await
    }

    async fn apply_paid(
        &self,
        order_id: Uuid,
        version: i64,
        payment_id: Uuid,
        payment_method: &str,
        paid_at: DateTime<Utc>,
    ) -> Result<ApplyOutcome, ReadModelError> {
        ReadModelStore::apply_paid(self, order_id, version, payment_id, payment_method, paid_at)
            .await
    }

    async fn apply_shipped(
        &self,
        order_id: Uuid,
        version: i64,
        shipment_id: Uuid,
        tracking_number: &str,
        shipped_at: DateTime<Utc>,
    ) -> Result<ApplyOutcome, ReadModelError> {
        ReadModelStore::apply_shipped(
            self,
            order_id,
            version,
            shipment_id,
            tracking_number,
            shipped_at,
        )
        .await
    }

    async fn apply_cancelled(
        &self,
        order_id: Uuid,
        version: i64,
        reason: &str,
        cancelled_at: DateTime<Utc>,
    ) -> Result<ApplyOutcome, ReadModelError> {
        ReadModelStore::apply_cancelled(self, order_id, version, reason, cancelled_at).await
    }
}

/// Applies one decoded event to the read model, and holds the bounded
/// per-aggregate parking buffer for events that arrive ahead of their
/// predecessor.
///
/// One `Projector` is shared across every consumer task: the per-partition
/// tasks all apply against the same read model and must agree on what is
/// parked.
pub struct Projector {
    store: Arc<dyn ReadModelSink>,
    parked: DashMap<Uuid, VecDeque<DecodedEnvelope>>,
    park_limit: usize,
}

impl Projector {
    /// Creates a projector over `store`, parking at most `park_limit`
    /// events per aggregate before dead-lettering (`PROJECTOR_PARK_LIMIT`,
    /// default 128).
    #[must_use]
    pub fn new(store: Arc<dyn ReadModelSink>, park_limit: usize) -> Self {
        Self {
            store,
            parked: DashMap::new(),
            park_limit: park_limit.max(1),
        }
    }

    /// Decodes and applies one raw message payload.
    ///
    /// # Errors
    ///
    /// Returns `ProjectionError::PoisonMessage` if the payload is
    /// undecodable or the parking buffer for its aggregate is already full;
    /// `ProjectionError::TransientIO` if the read model could not be
    /// reached.
    #[instrument(skip(self, payload))]
    pub async fn process_payload(&self, payload: &[u8]) -> Result<ApplyOutcome, ProjectionError> {
        let envelope = decode(payload)?;
        self.process(envelope).await
    }

    async fn process(&self, envelope: DecodedEnvelope) -> Result<ApplyOutcome, ProjectionError> {
        let outcome = apply(self.store.as_ref(), &envelope).await?;
        match outcome {
            ApplyOutcome::Applied => {
                self.drain(envelope.aggregate_id).await?;
                Ok(ApplyOutcome::Applied)
            }
            ApplyOutcome::Duplicate => Ok(ApplyOutcome::Duplicate),
            ApplyOutcome::Parked { expected_version } => {
                self.park(envelope)?;
                Ok(ApplyOutcome::Parked { expected_version })
            }
        }
    }

    /// Parks `envelope`, keeping the buffer ordered by ascending version
    /// regardless of arrival order. Created/Paid/Shipped/Cancelled flow on
    /// distinct topics, so their deliveries can interleave arbitrarily —
    /// e.g. a version-3 event may park before its version-2 predecessor
    /// does. `drain` always retries from the lowest parked version, so the
    /// buffer must stay sorted rather than FIFO-by-arrival.
    fn park(&self, envelope: DecodedEnvelope) -> Result<(), ProjectionError> {
        let mut buffer = self.parked.entry(envelope.aggregate_id).or_default();
        if buffer.len() >= self.park_limit {
            let event_type = envelope.event.event_type().to_string();
            error!(
                aggregate_id = %envelope.aggregate_id,
                park_limit = self.park_limit,
                "parking buffer exhausted, dead-lettering"
            );
            return Err(ProjectionError::PoisonMessage {
                event_type,
                reason: format!(
                    "parking buffer for this aggregate exceeded {} entries",
                    self.park_limit
                ),
            });
        }
        let position = buffer
            .iter()
            .position(|parked| parked.version > envelope.version)
            .unwrap_or(buffer.len());
        buffer.insert(position, envelope);
        Ok(())
    }

    /// Drains the parking buffer for `aggregate_id` as far forward as it
    /// will go, always retrying the lowest parked version next, and
    /// stopping at the first gap still outstanding. Because `park` keeps
    /// the buffer sorted ascending, the front is always that lowest
    /// version, so a still-parked event behind a gap is never skipped.
    async fn drain(&self, aggregate_id: Uuid) -> Result<(), ProjectionError> {
        loop {
            let next = match self.parked.get_mut(&aggregate_id) {
                Some(mut buffer) => buffer.pop_front(),
                None => return Ok(()),
            };
            let Some(envelope) = next else {
                self.parked.remove(&aggregate_id);
                return Ok(());
            };

            match apply(self.store.as_ref(), &envelope).await? {
                ApplyOutcome::Applied | ApplyOutcome::Duplicate => {}
                ApplyOutcome::Parked { .. } => {
                    // Still not ready; put it back at the front (it remains
                    // the lowest parked version) and stop.
                    if let Some(mut buffer) = self.parked.get_mut(&aggregate_id) {
                        buffer.push_front(envelope);
                    }
                    return Ok(());
                }
            }
        }
    }
}

async fn apply(
    store: &dyn ReadModelSink,
    envelope: &DecodedEnvelope,
) -> Result<ApplyOutcome, ProjectionError> {
    use order_domain::OrderEvent;

    let outcome = match &envelope.event {
        OrderEvent::Created {
            customer_id,
            items,
            total_amount,
            shipping_address,
            created_at,
        } => {
            store
                .apply_created(
                    envelope.aggregate_id,
                    envelope.version,
                    *customer_id,
                    items,
                    *total_amount,
                    shipping_address,
                    *created_at,
                )
                .await?
        }
        OrderEvent::Paid {
            payment_id,
            payment_method,
            paid_at,
            ..
        } => {
            store
                .apply_paid(
                    envelope.aggregate_id,
                    envelope.version,
                    *payment_id,
                    payment_method,
                    *paid_at,
                )
                .await?
        }
        OrderEvent::Shipped {
            shipment_id,
            tracking_number,
            shipped_date,
        } => {
            store
                .apply_shipped(
                    envelope.aggregate_id,
                    envelope.version,
                    *shipment_id,
                    tracking_number,
                    *shipped_date,
                )
                .await?
        }
        OrderEvent::Cancelled {
            reason,
            cancelled_at,
            ..
        } => {
            store
                .apply_cancelled(envelope.aggregate_id, envelope.version, reason, *cancelled_at)
                .await?
        }
    };

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use order_domain::{Order, OrderEvent};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeRow {
        last_applied_version: i64,
        history: Vec<String>,
    }

    #[derive(Default)]
    struct FakeReadModel {
        rows: Mutex<HashMap<Uuid, FakeRow>>,
    }

    impl FakeReadModel {
        fn transition(&self, order_id: Uuid, version: i64, kind: &str) -> ApplyOutcome {
            let mut rows = self.rows.lock().unwrap();
            match rows.get_mut(&order_id) {
                None => ApplyOutcome::Parked { expected_version: 1 },
                Some(row) if version <= row.last_applied_version => ApplyOutcome::Duplicate,
                Some(row) if version > row.last_applied_version + 1 => ApplyOutcome::Parked {
                    expected_version: row.last_applied_version + 1,
                },
                Some(row) => {
                    row.last_applied_version = version;
                    row.history.push(kind.to_string());
                    ApplyOutcome::Applied
                }
            }
        }

        fn history_of(&self, order_id: Uuid) -> Vec<String> {
            self.rows
                .lock()
                .unwrap()
                .get(&order_id)
                .map(|r| r.history.clone())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl ReadModelSink for FakeReadModel {
        async fn apply_created(
            &self,
            order_id: Uuid,
            version: i64,
            _customer_id: Uuid,
            _items: &[OrderItem],
            _total_amount: f64,
            _shipping_address: &str,
            _created_at: DateTime<Utc>,
        ) -> Result<ApplyOutcome, ReadModelError> {
            let mut rows = self.rows.lock().unwrap();
            if rows.contains_key(&order_id) {
                return Ok(ApplyOutcome::Duplicate);
            }
            rows.insert(
                order_id,
                FakeRow {
                    last_applied_version: version,
                    history: vec!["created".to_string()],
                },
            );
            Ok(ApplyOutcome::Applied)
        }

        async fn apply_paid(
            &self,
            order_id: Uuid,
            version: i64,
            _payment_id: Uuid,
            _payment_method: &str,
            _paid_at: DateTime<Utc>,
        ) -> Result<ApplyOutcome, ReadModelError> {
            Ok(self.transition(order_id, version, "paid"))
        }

        async fn apply_shipped(
            &self,
            order_id: Uuid,
            version: i64,
            _shipment_id: Uuid,
            _tracking_number: &str,
            _shipped_at: DateTime<Utc>,
        ) -> Result<ApplyOutcome, ReadModelError> {
            Ok(self.transition(order_id, version, "shipped"))
        }

        async fn apply_cancelled(
            &self,
            order_id: Uuid,
            version: i64,
            _reason: &str,
            _cancelled_at: DateTime<Utc>,
        ) -> Result<ApplyOutcome, ReadModelError> {
            Ok(self.transition(order_id, version, "cancelled"))
        }
    }

    fn envelope(aggregate_id: Uuid, version: i64, event: OrderEvent) -> DecodedEnvelope {
        DecodedEnvelope {
            aggregate_id,
            version,
            event,
        }
    }

    fn created_event() -> OrderEvent {
        Order::create(
            Uuid::new_v4(),
            vec![OrderItem {
                product_id: Uuid::new_v4(),
                product_name: "widget".to_string(),
                quantity: 1,
                unit_price: 10.0,
            }],
            "addr".to_string(),
        )
        .unwrap()
    }

    fn paid_event() -> OrderEvent {
        OrderEvent::Paid {
            payment_id: Uuid::new_v4(),
            amount_paid: 10.0,
            payment_method: "card".to_string(),
            paid_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn applies_events_received_in_order() {
        let store = Arc::new(FakeReadModel::default());
        let projector = Projector::new(store.clone(), 128);
        let id = Uuid::new_v4();

        let outcome = projector
            .process(envelope(id, 1, created_event()))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);

        let outcome = projector
            .process(envelope(id, 2, paid_event()))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);

        assert_eq!(store.history_of(id), vec!["created", "paid"]);
    }

    #[tokio::test]
    async fn paid_before_created_is_parked_then_drained_once_created_arrives() {
        let store = Arc::new(FakeReadModel::default());
        let projector = Projector::new(store.clone(), 128);
        let id = Uuid::new_v4();

        let outcome = projector
            .process(envelope(id, 2, paid_event()))
            .await
            .unwrap();
        assert!(matches!(outcome, ApplyOutcome::Parked { .. }));
        assert!(store.history_of(id).is_empty());

        let outcome = projector
            .process(envelope(id, 1, created_event()))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);

        assert_eq!(store.history_of(id), vec!["created", "paid"]);
    }

    #[tokio::test]
    async fn parked_events_drain_in_version_order_even_when_arrival_order_differs() {
        let store = Arc::new(FakeReadModel::default());
        let projector = Projector::new(store.clone(), 128);
        let id = Uuid::new_v4();

        // Shipped (v3) arrives before its predecessor Paid (v2); both park.
        let outcome = projector
            .process(envelope(id, 3, OrderEvent::Shipped {
                shipment_id: Uuid::new_v4(),
                tracking_number: "1Z999".to_string(),
                shipped_date: Utc::now(),
            }))
            .await
            .unwrap();
        assert!(matches!(outcome, ApplyOutcome::Parked { .. }));

        let outcome = projector
            .process(envelope(id, 2, paid_event()))
            .await
            .unwrap();
        assert!(matches!(outcome, ApplyOutcome::Parked { .. }));

        // Created (v1) arrives last and should drain both v2 and v3 in order.
        let outcome = projector
            .process(envelope(id, 1, created_event()))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);

        assert_eq!(store.history_of(id), vec!["created", "paid", "shipped"]);
    }

    #[tokio::test]
    async fn duplicate_event_is_ignored() {
        let store = Arc::new(FakeReadModel::default());
        let projector = Projector::new(store.clone(), 128);
        let id = Uuid::new_v4();

        projector
            .process(envelope(id, 1, created_event()))
            .await
            .unwrap();
        let outcome = projector
            .process(envelope(id, 1, created_event()))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Duplicate);
        assert_eq!(store.history_of(id), vec!["created"]);
    }

    #[tokio::test]
    async fn parking_buffer_dead_letters_past_its_limit() {
        let store = Arc::new(FakeReadModel::default());
        let projector = Projector::new(store, 2);
        let id = Uuid::new_v4();

        // Versions 2, 3 park (no row yet); version 4 overflows the 2-slot buffer.
        projector.process(envelope(id, 2, paid_event())).await.unwrap();
        projector
            .process(envelope(id, 3, OrderEvent::Shipped {
                shipment_id: Uuid::new_v4(),
                tracking_number: "1Z999".to_string(),
                shipped_date: Utc::now(),
            }))
            .await
            .unwrap();

        let err = projector
            .process(envelope(
                id,
                4,
                OrderEvent::Cancelled {
                    reason: "too slow".to_string(),
                    refund_required: true,
                    cancelled_at: Utc::now(),
                },
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, ProjectionError::PoisonMessage { .. }));
    }
}
