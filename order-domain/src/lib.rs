//! The `Order` aggregate: domain events, commands, state machine, and
//! rehydration, built on top of the `sourcerer` event-sourcing framework.
#![deny(missing_docs)]

pub mod aggregate;
pub mod commands;
pub mod error;
pub mod events;

pub use aggregate::{Order, OrderSnapshot, OrderStatus};
pub use commands::OrderCommand;
pub use error::OrderError;
pub use events::{OrderEvent, OrderItem};
