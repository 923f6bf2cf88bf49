pub mod amqp;
pub mod cache;
pub mod config;
pub mod delivery;
pub mod dlq;
pub mod envelope;
pub mod error;
pub mod lifecycle;
pub mod log_broker;

pub use delivery::{BrokerFamily, DeliveryMode, DeliveryStrategy, Role};
pub use dlq::{DeadLetterRouter, DeadLetterSink};
pub use envelope::{Destination, MessageEnvelope};
pub use error::{TransportError, TransportResult};
pub use lifecycle::{Flushable, Lifecycle};
