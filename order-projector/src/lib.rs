//! Subscribes to the `orders.*` topics and keeps the read model
//! (`order-readmodel`) in sync, enforcing the out-of-order/idempotence
//! policy the event publisher's at-least-once delivery requires.
#![deny(missing_docs)]

mod consumer;
mod envelope;
mod error;
mod projector;

pub use consumer::{build_consumer, run, spawn_workers};
pub use envelope::{DecodedEnvelope, decode};
pub use error::ProjectionError;
pub use projector::Projector;
