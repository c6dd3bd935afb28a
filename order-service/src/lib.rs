//! Orchestrates the load-invoke-append-publish cycle for `Order` commands.
#![deny(missing_docs)]

use std::sync::Arc;

use backoff::ExponentialBackoffBuilder;
use backoff::backoff::Backoff;
use order_domain::{Order, OrderCommand, OrderError, OrderSnapshot};
use order_publisher::{EventPublisher, OutboxSweeper, PublishError};
use sourcerer::{Aggregate, EventStore, SnapshotStore};
use tracing::{instrument, warn};
use uuid::Uuid;

/// Errors a command can fail with, after the command handler has exhausted
/// whatever recovery it owns.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// No events or snapshot exist for the aggregate, and the command was
    /// not `Create`.
    #[error("aggregate not found")]
    NotFound,
    /// The domain operation itself rejected the command.
    #[error("domain error: {0}")]
    Domain(#[from] OrderError),
    /// The event store failed for a reason other than a concurrency
    /// conflict, or a conflict survived every retry attempt.
    #[error("event store error: {0}")]
    Store(#[from] sourcerer::Error),
    /// The event was durably appended but could not be published after its
    /// own retry policy was exhausted. The store is now ahead of the
    /// publisher; see [`OutboxSweeper`].
    #[error("publish error: {0}")]
    Publish(#[from] PublishError),
}

/// Governs how often a snapshot is persisted after a successful append.
///
/// A snapshot is taken when the newly stored version is positive and
/// divisible by `every`.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotPolicy {
    every: usize,
}

impl SnapshotPolicy {
    /// Creates a policy that snapshots every `every` versions. `every` is
    /// clamped to at least 1.
    #[must_use]
    pub fn new(every: usize) -> Self {
        Self {
            every: every.max(1),
        }
    }

    /// Whether a snapshot should be taken at `version`.
    #[must_use]
    pub fn should_snapshot(&self, version: i64) -> bool {
        version > 0 && version % self.every as i64 == 0
    }
}

impl Default for SnapshotPolicy {
    /// Matches `EVENT_LOG_SNAPSHOT_EVERY`'s default of 50.
    fn default() -> Self {
        Self::new(50)
    }
}

/// Orchestrates one command against one `Order` aggregate: load, invoke,
/// append, publish.
pub struct CommandHandler<S, SS> {
    store: Arc<S>,
    snapshot_store: Arc<SS>,
    publisher: Arc<dyn EventPublisher>,
    outbox: Arc<OutboxSweeper<S>>,
    snapshot_policy: SnapshotPolicy,
    max_attempts: usize,
}

impl<S, SS> CommandHandler<S, SS>
where
    S: EventStore<Order> + 'static,
    SS: SnapshotStore<Order> + 'static,
{
    /// Creates a handler over the given store, snapshot store, publisher,
    /// and outbox sweeper. Retries up to 3 times on a concurrency conflict
    /// by default; use [`Self::with_max_attempts`] to override.
    pub fn new(
        store: Arc<S>,
        snapshot_store: Arc<SS>,
        publisher: Arc<dyn EventPublisher>,
        outbox: Arc<OutboxSweeper<S>>,
        snapshot_policy: SnapshotPolicy,
    ) -> Self {
        Self {
            store,
            snapshot_store,
            publisher,
            outbox,
            snapshot_policy,
            max_attempts: 3,
        }
    }

    /// Overrides the bounded retry attempt count (default 3).
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Runs the load-invoke-append-publish cycle for `command` against
    /// aggregate `id`.
    ///
    /// # Errors
    ///
    /// Returns `HandlerError::NotFound` if no history exists for `id` and
    /// `command` is not `Create`; `HandlerError::Domain` if the domain
    /// operation rejects the command; `HandlerError::Store` if the event
    /// store fails, including after every conflict retry is exhausted;
    /// `HandlerError::Publish` if the appended events could not be
    /// published.
    #[instrument(skip(self, command), fields(aggregate_id = %id))]
    pub async fn handle(&self, id: Uuid, command: OrderCommand) -> Result<Order, HandlerError> {
        let is_create = matches!(command, OrderCommand::Create { .. });
        let mut backoff = ExponentialBackoffBuilder::new().build();
        let mut last_conflict: Option<HandlerError> = None;

        for attempt in 1..=self.max_attempts {
            let order = self.load(id, is_create).await?;
            let version_before = order.version();
            let new_events = order.handle(command.clone()).await?;

            let mut updated = order.clone();
            for event in &new_events {
                updated.apply(event);
            }

            match self.store.append(&id, version_before, new_events).await {
                Ok(stored) => {
                    if let Some(last) = stored.last() {
                        self.outbox.mark_appended(&id.to_string(), last.version());
                    }
                    self.maybe_snapshot(&updated).await;
                    self.publisher.publish(&stored).await?;
                    if let Some(last) = stored.last() {
                        self.outbox.mark_published(&id.to_string(), last.version());
                    }
                    return Ok(updated);
                }
                Err(sourcerer::Error::Conflict) => {
                    warn!(attempt, "concurrency conflict, retrying");
                    last_conflict = Some(HandlerError::Store(sourcerer::Error::Conflict));
                    if attempt < self.max_attempts {
                        if let Some(delay) = backoff.next_backoff() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
                Err(e) => return Err(HandlerError::Store(e)),
            }
        }

        Err(last_conflict.unwrap_or(HandlerError::Store(sourcerer::Error::Conflict)))
    }

    async fn load(&self, id: Uuid, is_create: bool) -> Result<Order, HandlerError> {
        let snapshot = self.snapshot_store.load(&id).await?;
        let (starting, starting_version): (Option<(OrderSnapshot, i64)>, i64) = match snapshot {
            Some(stored) => {
                let v = stored.version();
                (Some((stored.into_snapshot(), v)), v)
            }
            None => (None, 0),
        };

        let events = self.store.load_from(&id, starting_version).await?;
        if events.is_empty() && starting.is_none() && !is_create {
            return Err(HandlerError::NotFound);
        }

        Ok(Order::rehydrate(id, starting, &events)?)
    }

    /// Best-effort: snapshot creation never affects the success of the
    /// append it follows. A failure here is logged and swallowed rather
    /// than propagated, so it can never fail the command or skip the
    /// publish step that must still run against the already-durable
    /// append.
    async fn maybe_snapshot(&self, updated: &Order) {
        let version = updated.version();
        if self.snapshot_policy.should_snapshot(version) {
            if let Err(e) = self
                .snapshot_store
                .save(updated.id(), version, updated.snapshot())
                .await
            {
                warn!(
                    aggregate_id = %updated.id(),
                    version,
                    error = %e,
                    "failed to save snapshot, continuing without it"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use order_domain::OrderItem;
    use sourcerer::StoredEvent;
    use sourcerer::store::in_memory::InMemoryEventStore;
    use sourcerer::store::in_memory_snapshot::InMemorySnapshotStore;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPublisher {
        received: Mutex<Vec<StoredEvent<order_domain::OrderEvent>>>,
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(
            &self,
            events: &[StoredEvent<order_domain::OrderEvent>],
        ) -> Result<(), PublishError> {
            self.received.lock().unwrap().extend_from_slice(events);
            Ok(())
        }
    }

    fn items() -> Vec<OrderItem> {
        vec![OrderItem {
            product_id: Uuid::new_v4(),
            product_name: "widget".to_string(),
            quantity: 2,
            unit_price: 9.5,
        }]
    }

    fn handler() -> (
        CommandHandler<InMemoryEventStore<Order>, InMemorySnapshotStore<Order>>,
        Arc<RecordingPublisher>,
    ) {
        let store = Arc::new(InMemoryEventStore::<Order>::default());
        let snapshot_store = Arc::new(InMemorySnapshotStore::<Order>::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let outbox = Arc::new(OutboxSweeper::new(
            Arc::clone(&store),
            publisher.clone() as Arc<dyn EventPublisher>,
        ));
        let handler = CommandHandler::new(
            store,
            snapshot_store,
            publisher.clone() as Arc<dyn EventPublisher>,
            outbox,
            SnapshotPolicy::default(),
        );
        (handler, publisher)
    }

    #[tokio::test]
    async fn create_pay_ship_happy_path_publishes_in_order() {
        let (handler, publisher) = handler();
        let id = Uuid::new_v4();

        let order = handler
            .handle(
                id,
                OrderCommand::Create {
                    customer_id: Uuid::new_v4(),
                    items: items(),
                    shipping_address: "1 Infinite Loop".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(order.version(), 1);

        let order = handler
            .handle(
                id,
                OrderCommand::MarkPaid {
                    payment_id: Uuid::new_v4(),
                    amount: order.total_amount(),
                    method: "card".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(order.version(), 2);

        let order = handler
            .handle(
                id,
                OrderCommand::Ship {
                    shipment_id: Uuid::new_v4(),
                    tracking_number: "1Z999".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(order.version(), 3);

        let received = publisher.received.lock().unwrap();
        let versions: Vec<i64> = received.iter().map(StoredEvent::version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn mark_paid_on_unknown_aggregate_is_not_found() {
        let (handler, _publisher) = handler();
        let err = handler
            .handle(
                Uuid::new_v4(),
                OrderCommand::MarkPaid {
                    payment_id: Uuid::new_v4(),
                    amount: 19.0,
                    method: "card".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::NotFound));
    }

    #[tokio::test]
    async fn second_of_two_pay_commands_fails_domain_validation() {
        let (handler, _publisher) = handler();
        let id = Uuid::new_v4();
        handler
            .handle(
                id,
                OrderCommand::Create {
                    customer_id: Uuid::new_v4(),
                    items: items(),
                    shipping_address: "1 Infinite Loop".to_string(),
                },
            )
            .await
            .unwrap();

        let handler = Arc::new(handler);
        let (h1, h2) = (Arc::clone(&handler), Arc::clone(&handler));
        let total = items().iter().map(OrderItem::line_total).sum::<f64>();

        let (r1, r2) = tokio::join!(
            h1.handle(
                id,
                OrderCommand::MarkPaid {
                    payment_id: Uuid::new_v4(),
                    amount: total,
                    method: "card".to_string(),
                },
            ),
            h2.handle(
                id,
                OrderCommand::MarkPaid {
                    payment_id: Uuid::new_v4(),
                    amount: total,
                    method: "wire".to_string(),
                },
            ),
        );

        // Whichever commits first wins the append; the other reloads (either
        // after a conflict-triggered retry, or because `join!` happened to
        // serialize the two futures) and finds the order already `Paid`,
        // which `mark_paid` rejects.
        let results = [r1, r2];
        let ok_count = results.iter().filter(|r| r.is_ok()).count();
        let domain_err_count = results
            .iter()
            .filter(|r| matches!(r, Err(HandlerError::Domain(OrderError::IllegalTransition { .. }))))
            .count();
        assert_eq!(ok_count, 1, "exactly one pay command should succeed");
        assert_eq!(domain_err_count, 1, "the other should fail domain validation");
    }

    #[test]
    fn snapshot_policy_fires_only_on_multiples() {
        let policy = SnapshotPolicy::new(50);
        assert!(!policy.should_snapshot(0));
        assert!(!policy.should_snapshot(49));
        assert!(policy.should_snapshot(50));
        assert!(!policy.should_snapshot(51));
        assert!(policy.should_snapshot(100));
    }

    #[test]
    fn snapshot_policy_clamps_zero_frequency_to_one() {
        let policy = SnapshotPolicy::new(0);
        assert!(policy.should_snapshot(1));
    }

    #[derive(Default)]
    struct FailingSnapshotStore;

    #[async_trait]
    impl SnapshotStore<Order> for FailingSnapshotStore {
        async fn save(&self, _aggregate_id: &Uuid, _version: i64, _snapshot: OrderSnapshot) -> sourcerer::Result<()> {
            Err(sourcerer::Error::Store("disk full".to_string()))
        }

        async fn load(
            &self,
            _aggregate_id: &Uuid,
        ) -> sourcerer::Result<Option<sourcerer::snapshot::StoredSnapshot<OrderSnapshot>>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn snapshot_store_failure_does_not_fail_the_command_or_skip_publish() {
        let store = Arc::new(InMemoryEventStore::<Order>::default());
        let snapshot_store = Arc::new(FailingSnapshotStore);
        let publisher = Arc::new(RecordingPublisher::default());
        let outbox = Arc::new(OutboxSweeper::new(
            Arc::clone(&store),
            publisher.clone() as Arc<dyn EventPublisher>,
        ));
        // every version is a snapshot point, so Create alone exercises the
        // failing save path.
        let handler = CommandHandler::new(
            store,
            snapshot_store,
            publisher.clone() as Arc<dyn EventPublisher>,
            outbox,
            SnapshotPolicy::new(1),
        );
        let id = Uuid::new_v4();

        let order = handler
            .handle(
                id,
                OrderCommand::Create {
                    customer_id: Uuid::new_v4(),
                    items: items(),
                    shipping_address: "1 Infinite Loop".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(order.version(), 1);

        let received = publisher.received.lock().unwrap();
        assert_eq!(received.len(), 1, "publish must still run despite the snapshot failure");
    }
}
