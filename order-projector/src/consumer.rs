//! Wires `Projector` to a Kafka consumer group.
//!
//! "One task per partition" is realized as a pool of independent consumer
//! instances in the same consumer group: Kafka's own group-coordinator
//! assigns each instance a disjoint set of partitions, which is exactly
//! what a manually-split per-partition task pool would also end up with,
//! without reaching for `rdkafka`'s lower-level partition-queue APIs that
//! nothing in this workspace's retrieved corpus demonstrates.

use std::sync::Arc;

use futures::StreamExt;
use order_readmodel::ApplyOutcome;
use rdkafka::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use tracing::{error, instrument, warn};

use crate::error::ProjectionError;
use crate::projector::Projector;

/// Builds a manual-commit `StreamConsumer` subscribed to `topics` in
/// `group_id`.
///
/// # Errors
///
/// Returns `ProjectionError::ConsumerSetup` if the client could not be
/// constructed or the subscription failed.
pub fn build_consumer(
    group_id: &str,
    bootstrap_servers: &str,
    auto_offset_reset: &str,
    topics: &[&str],
) -> Result<StreamConsumer, ProjectionError> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", bootstrap_servers)
        .set("group.id", group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", auto_offset_reset)
        .set("session.timeout.ms", "6000")
        .set("enable.partition.eof", "false")
        .create()
        .map_err(|e| ProjectionError::ConsumerSetup(e.to_string()))?;

    consumer
        .subscribe(topics)
        .map_err(|e| ProjectionError::ConsumerSetup(e.to_string()))?;

    Ok(consumer)
}

/// Spawns `worker_count` independent consumer tasks, all members of
/// `group_id`, each running [`run`] against `projector`.
///
/// # Errors
///
/// Returns `ProjectionError::ConsumerSetup` if any consumer could not be
/// constructed; consumers already spawned keep running.
pub fn spawn_workers(
    worker_count: usize,
    group_id: &str,
    bootstrap_servers: &str,
    auto_offset_reset: &str,
    topics: &[&str],
    projector: Arc<Projector>,
) -> Result<Vec<tokio::task::JoinHandle<Result<(), ProjectionError>>>, ProjectionError> {
    let mut handles = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let consumer = build_consumer(group_id, bootstrap_servers, auto_offset_reset, topics)?;
        let projector = Arc::clone(&projector);
        handles.push(tokio::spawn(async move { run(consumer, projector).await }));
    }
    Ok(handles)
}

/// Consumes `consumer`'s stream until it closes, applying each message
/// through `projector` and committing offsets only once the read-model
/// transaction for that message (or, for a dead-lettered poison message,
/// the decision to drop it) has committed — never before. A parked
/// event's offset is deliberately left uncommitted.
#[instrument(skip(consumer, projector))]
pub async fn run(consumer: StreamConsumer, projector: Arc<Projector>) -> Result<(), ProjectionError> {
    let mut stream = consumer.stream();

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "kafka transport error, will retry");
                continue;
            }
        };

        let Some(payload) = message.payload() else {
            warn!("message has no payload, dead-lettering");
            commit(&consumer, &message);
            continue;
        };

        match projector.process_payload(payload).await {
            Ok(ApplyOutcome::Parked { expected_version }) => {
                warn!(
                    expected_version,
                    "event parked pending its predecessor, offset left uncommitted"
                );
            }
            Ok(ApplyOutcome::Applied | ApplyOutcome::Duplicate) => {
                commit(&consumer, &message);
            }
            Err(ProjectionError::PoisonMessage { event_type, reason }) => {
                error!(event_type, reason, "dead-lettering poison message");
                commit(&consumer, &message);
            }
            Err(err @ ProjectionError::TransientIO(_)) => {
                warn!(error = %err, "transient read-model error, offset left uncommitted");
            }
            Err(err @ ProjectionError::ConsumerSetup(_)) => {
                // Unreachable from `process_payload`, but exhaustive match
                // keeps this loop honest if that changes.
                error!(error = %err, "unexpected consumer error while processing a message");
            }
        }
    }

    Ok(())
}

fn commit(consumer: &StreamConsumer, message: &rdkafka::message::BorrowedMessage<'_>) {
    if let Err(e) = consumer.commit_message(message, CommitMode::Async) {
        warn!(error = %e, "failed to commit offset");
    }
}
