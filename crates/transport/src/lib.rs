//! Message transport for the order fulfillment worker.
//!
//! Defines the queue topology the worker relies on, the [`Publisher`] and
//! [`Broker`] traits the handlers and consumer loops are written against,
//! and two implementations: RabbitMQ over AMQP 0.9.1 (`lapin`) and an
//! in-memory broker for tests.

pub mod broker;
pub mod error;
pub mod memory;
pub mod message;
pub mod queues;
pub mod rabbitmq;

pub use broker::{Broker, BrokerExt, DeliveryStream, Publisher};
pub use error::{Result, TransportError};
pub use memory::InMemoryTransport;
pub use message::{Acknowledger, Delivery, OutboundMessage};
pub use queues::{DeadLetter, QueueSpec};
pub use rabbitmq::RabbitMqTransport;
