//! The projection consumer's error taxonomy.

/// Errors the projection consumer can encounter while processing one
/// message.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// The read model could not be reached or the write failed for a
    /// reason unrelated to the message's content. Retryable: the caller
    /// should back off and leave the offset uncommitted.
    #[error("transient read-model error: {0}")]
    TransientIO(#[from] order_readmodel::ReadModelError),

    /// The message itself is malformed (undecodable envelope, missing
    /// extension attributes, or a payload that doesn't match any known
    /// event shape). Not retryable: the caller should dead-letter and
    /// commit past it.
    #[error("poison message ({event_type}): {reason}")]
    PoisonMessage {
        /// The CloudEvents `type` of the offending message, or a sentinel
        /// when even that could not be read.
        event_type: String,
        /// Human-readable description of what was wrong with the message.
        reason: String,
    },

    /// The Kafka consumer itself could not be constructed or subscribed.
    #[error("kafka consumer setup failed: {0}")]
    ConsumerSetup(String),
}
