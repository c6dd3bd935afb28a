//! Publishes committed order events onto a partitioned log, and recovers
//! from publish failures that leave the event store ahead of the log.
#![deny(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use backoff::future::retry;
use cloudevents::event::{Data, EventBuilder, EventBuilderV10};
use dashmap::DashMap;
use order_domain::OrderEvent;
use rdkafka::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use sourcerer::{Event as _, StoredEvent};
use tracing::{instrument, warn};
use url::Url;

/// Errors the publisher can return to its caller.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The event could not be encoded as a CloudEvent envelope.
    #[error("failed to encode event: {0}")]
    Encode(String),
    /// Delivery to the log failed even after the retry policy was
    /// exhausted. The event store remains ahead of the publisher; see the
    /// outbox sweep for recovery.
    #[error("publish failed after retries: {0}")]
    DeliveryFailed(String),
}

/// Publishes a batch of stored events for one aggregate, in order.
///
/// Implementations are expected to be thread-safe and shareable across
/// command-handler tasks — a single producer may be shared.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes `events`, which must already be in ascending version
    /// order for their aggregate.
    ///
    /// # Errors
    ///
    /// Returns `PublishError` if any event in the batch could not be
    /// delivered after the retry policy is exhausted. Events before the
    /// failing one have already been sent; callers must not assume
    /// all-or-nothing semantics across the batch.
    async fn publish(&self, events: &[StoredEvent<OrderEvent>]) -> Result<(), PublishError>;
}

/// The topic an event is published to: `orders.<kind-lowercase>`.
#[must_use]
pub fn topic_for(event_type: &str) -> String {
    format!("orders.{}", event_type.to_lowercase())
}

/// A Kafka-backed `EventPublisher`.
pub struct KafkaEventPublisher {
    producer: FutureProducer,
    retry_max_elapsed: Duration,
}

impl KafkaEventPublisher {
    /// Builds a producer connected to `bootstrap_servers`, retrying each
    /// publish for up to `retry_max_elapsed` before giving up.
    ///
    /// # Errors
    ///
    /// Returns `PublishError::DeliveryFailed` if the underlying Kafka
    /// client could not be constructed.
    pub fn new(
        client_id: &str,
        bootstrap_servers: &str,
        retry_max_elapsed: Duration,
    ) -> Result<Self, PublishError> {
        let producer = ClientConfig::new()
            .set("client.id", client_id)
            .set("bootstrap.servers", bootstrap_servers)
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(|e| PublishError::DeliveryFailed(e.to_string()))?;

        Ok(Self {
            producer,
            retry_max_elapsed,
        })
    }

    fn encode(stored: &StoredEvent<OrderEvent>) -> Result<Vec<u8>, PublishError> {
        let event = stored.event();
        let data = serde_json::to_vec(event)
            .map_err(|e| PublishError::Encode(format!("serializing payload: {e}")))?;

        let source = Url::parse(event.event_source())
            .unwrap_or_else(|_| Url::parse("urn:order-service:order").expect("default URN is valid"));

        let ce = EventBuilderV10::new()
            .id(uuid::Uuid::new_v4().to_string())
            .ty(event.event_type())
            .source(source)
            .time(event.occurred_at())
            .extension("aggregateid", stored.aggregate_id().to_string())
            .extension("version", stored.version().to_string())
            .data("application/json", Data::from(data))
            .build()
            .map_err(|e| PublishError::Encode(format!("building cloud event: {e}")))?;

        serde_json::to_vec(&ce).map_err(|e| PublishError::Encode(format!("encoding envelope: {e}")))
    }
}

#[async_trait]
impl EventPublisher for KafkaEventPublisher {
    #[instrument(skip(self, events))]
    async fn publish(&self, events: &[StoredEvent<OrderEvent>]) -> Result<(), PublishError> {
        for stored in events {
            let topic = topic_for(stored.event_type());
            let key = stored.aggregate_id().to_string();
            let payload = Self::encode(stored)?;

            let backoff = ExponentialBackoffBuilder::new()
                .with_max_elapsed_time(Some(self.retry_max_elapsed))
                .build();

            retry(backoff, || {
                let producer = &self.producer;
                let topic = topic.clone();
                let key = key.clone();
                let payload = payload.clone();
                async move {
                    let record = FutureRecord::to(&topic).payload(&payload).key(&key);
                    producer
                        .send(record, Timeout::After(Duration::from_secs(5)))
                        .await
                        .map(|_| ())
                        .map_err(|(e, _)| {
                            warn!(error = %e, topic, "publish attempt failed, retrying");
                            backoff::Error::transient(PublishError::DeliveryFailed(e.to_string()))
                        })
                }
            })
            .await?;
        }
        Ok(())
    }
}

/// Recovers from the "store ahead of publisher" condition: tracks,
/// per aggregate, the highest version successfully appended and the highest
/// version successfully published, and republishes the gap.
///
/// The high-water marks are process-local. This is sufficient because the
/// command handler registers every append with [`OutboxSweeper::mark_appended`]
/// and the sweep only needs to outlive a single publisher outage, not a
/// process restart — after a restart the next command for an aggregate
/// re-synchronizes both marks from the event store.
pub struct OutboxSweeper<S> {
    store: Arc<S>,
    publisher: Arc<dyn EventPublisher>,
    appended: DashMap<String, i64>,
    published: DashMap<String, i64>,
}

impl<S> OutboxSweeper<S>
where
    S: sourcerer::EventStore<order_domain::Order> + 'static,
{
    /// Creates a sweeper over `store`, republishing through `publisher`.
    pub fn new(store: Arc<S>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            store,
            publisher,
            appended: DashMap::new(),
            published: DashMap::new(),
        }
    }

    /// Records that `version` was successfully appended for `aggregate_id`.
    /// Called by the command handler immediately after a successful append.
    pub fn mark_appended(&self, aggregate_id: &str, version: i64) {
        self.appended
            .entry(aggregate_id.to_string())
            .and_modify(|v| *v = (*v).max(version))
            .or_insert(version);
    }

    /// Records that `version` was successfully published for
    /// `aggregate_id`. Called by the command handler after a successful
    /// publish.
    pub fn mark_published(&self, aggregate_id: &str, version: i64) {
        self.published
            .entry(aggregate_id.to_string())
            .and_modify(|v| *v = (*v).max(version))
            .or_insert(version);
    }

    /// Scans every tracked aggregate whose appended version exceeds its
    /// published version, and republishes the missing range.
    ///
    /// Returns the number of aggregates for which events were republished.
    ///
    /// # Errors
    ///
    /// Returns `PublishError` from the first republish attempt that fails
    /// after its own retry policy is exhausted; aggregates already swept in
    /// this call remain caught up.
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<usize, PublishError> {
        let mut swept = 0;
        let gaps: Vec<(String, i64, i64)> = self
            .appended
            .iter()
            .filter_map(|entry| {
                let aggregate_id = entry.key().clone();
                let appended = *entry.value();
                let published = self.published.get(&aggregate_id).map_or(0, |v| *v);
                (appended > published).then_some((aggregate_id, published, appended))
            })
            .collect();

        for (aggregate_id, published, appended) in gaps {
            let id: uuid::Uuid = aggregate_id
                .parse()
                .map_err(|e| PublishError::Encode(format!("invalid aggregate id: {e}")))?;
            let missing = self
                .store
                .load_from(&id, published)
                .await
                .map_err(|e| PublishError::DeliveryFailed(e.to_string()))?;
            if missing.is_empty() {
                continue;
            }
            self.publisher.publish(&missing).await?;
            self.published.insert(aggregate_id, appended);
            swept += 1;
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use order_domain::{Order, OrderItem};
    use sourcerer::EventStore;
    use sourcerer::store::in_memory::InMemoryEventStore;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[test]
    fn topic_naming_is_lowercase_kind() {
        assert_eq!(topic_for("Created"), "orders.created");
        assert_eq!(topic_for("Cancelled"), "orders.cancelled");
    }

    #[derive(Default)]
    struct RecordingPublisher {
        received: Mutex<Vec<StoredEvent<OrderEvent>>>,
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(&self, events: &[StoredEvent<OrderEvent>]) -> Result<(), PublishError> {
            self.received.lock().unwrap().extend_from_slice(events);
            Ok(())
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
            "A".to_string(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn sweep_republishes_only_the_unpublished_tail() {
        let store = Arc::new(InMemoryEventStore::<Order>::default());
        let id = Uuid::new_v4();
        let stored = store
            .append(&id, 0, vec![created_event(), created_event()])
            .await
            .unwrap();

        let publisher = Arc::new(RecordingPublisher::default());
        let sweeper = OutboxSweeper::new(Arc::clone(&store), publisher.clone() as Arc<dyn EventPublisher>);

        sweeper.mark_appended(&id.to_string(), stored.len() as i64);
        // Pretend only the first event made it to the log.
        sweeper.mark_published(&id.to_string(), 1);

        let swept = sweeper.sweep_once().await.unwrap();
        assert_eq!(swept, 1);

        let received = publisher.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].version(), 2);
    }

    #[tokio::test]
    async fn sweep_is_a_no_op_when_nothing_is_behind() {
        let store = Arc::new(InMemoryEventStore::<Order>::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let sweeper = OutboxSweeper::new(store, publisher.clone() as Arc<dyn EventPublisher>);

        let id = Uuid::new_v4();
        sweeper.mark_appended(&id.to_string(), 3);
        sweeper.mark_published(&id.to_string(), 3);

        let swept = sweeper.sweep_once().await.unwrap();
        assert_eq!(swept, 0);
        assert!(publisher.received.lock().unwrap().is_empty());
    }
}
