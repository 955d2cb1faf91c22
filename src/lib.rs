//! HopHop — message consumption runtime between an AMQP broker and consumer logic.

pub mod config;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod filter;
pub mod resolver;
pub mod runtime;
pub mod transport;

pub use config::{ConsumerConfig, HaltAction, QueueBinding};
pub use consumer::{Consumer, LoopControl, Policy};
pub use envelope::{Delivery, DeliveryContext, DeliveryInfo, Envelope, EnvelopeBuilder, Headers, Metadata};
pub use error::{ConfigError, Error, Result, TransportError};
pub use filter::{FilterChain, FilterOutcome};
pub use resolver::{BrokerAction, ConsumeOutcome, OutcomeResolver, Resolution};
pub use runtime::{ConsumptionLoop, LoopState, LoopStats, StopHandle, StopReason};
pub use transport::{MemoryBroker, MemoryTransport, Transport};
