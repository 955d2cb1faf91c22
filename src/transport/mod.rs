//! Broker transports.
//!
//! The consumption loop only talks to a [`Transport`]: pull the next
//! delivery, acknowledge it, or requeue it. Implementations:
//! - `memory` — in-process broker used for tests and synthetic events
//! - `amqp` — RabbitMQ via lapin (feature `amqp`)

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::envelope::Delivery;
use crate::error::TransportError;

#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
pub use memory::{MemoryBroker, MemoryTransport};

/// Connection to a single bound queue.
///
/// Requeue must leave the message redeliverable; it is never dropped.
#[async_trait]
pub trait Transport: Send {
    /// Transport name for logging.
    fn name(&self) -> &str;

    /// Wait up to `timeout` for the next delivery. `Ok(None)` means nothing arrived.
    ///
    /// A delivery that cannot be decoded must be settled here (rejected or
    /// acknowledged). Reporting it as [`TransportError::Decode`] lets the
    /// loop skip it and keep running.
    async fn receive_next(&mut self, timeout: Duration) -> Result<Option<Delivery>, TransportError>;

    /// Mark the delivery as fully handled.
    async fn acknowledge(&mut self, delivery_tag: u64) -> Result<(), TransportError>;

    /// Return the delivery to the queue for redelivery.
    async fn requeue(&mut self, delivery_tag: u64) -> Result<(), TransportError>;

    /// Close the connection.
    async fn close(&mut self) -> Result<(), TransportError>;
}
