use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;

use crate::{Delivery, OutboundMessage, QueueSpec, Result};

/// A stream of unsettled deliveries from one queue.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery>> + Send>>;

/// Publishes messages to named queues.
///
/// Handlers only ever need this half of the broker, which keeps them
/// testable against the in-memory transport.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `message` to `queue` through the default exchange.
    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<()>;
}

/// Full broker access: topology declaration and consumption.
#[async_trait]
pub trait Broker: Publisher {
    /// Declares a durable queue (and its dead-letter exchange and queue, if
    /// any). Declaring the same queue twice is harmless.
    async fn declare(&self, spec: &QueueSpec) -> Result<()>;

    /// Starts consuming `queue`, letting the broker hand out at most
    /// `prefetch` unsettled deliveries at a time.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream>;
}

/// Extension trait providing convenience methods for brokers.
#[async_trait]
pub trait BrokerExt: Broker {
    /// Declares every queue in `specs`.
    async fn declare_all(&self, specs: &[QueueSpec]) -> Result<()> {
        for spec in specs {
            self.declare(spec).await?;
        }
        Ok(())
    }
}

impl<T: Broker + ?Sized> BrokerExt for T {}
