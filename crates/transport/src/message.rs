use std::collections::BTreeMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::Result;

/// A message about to be published.
///
/// The body is sent as-is. Headers travel next to the body (AMQP message
/// headers), which lets a publisher attach metadata such as trace context
/// without altering the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub message_id: Uuid,
    pub body: Vec<u8>,
    pub headers: BTreeMap<String, String>,
}

impl OutboundMessage {
    /// A message with a fresh ID and no headers.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            body: body.into(),
            headers: BTreeMap::new(),
        }
    }

    /// Adds headers, replacing any with the same name.
    pub fn with_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Confirms the delivery was processed.
    async fn ack(&self) -> Result<()>;

    /// Refuses the delivery without requeueing it, so the broker applies the
    /// queue's dead-letter policy.
    async fn reject(&self) -> Result<()>;
}

/// A message received from a queue, not yet settled.
pub struct Delivery {
    pub queue: String,
    pub body: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        queue: impl Into<String>,
        body: Vec<u8>,
        headers: BTreeMap<String, String>,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            queue: queue.into(),
            body,
            headers,
            redelivered,
            acker,
        }
    }

    /// Confirms the delivery.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Rejects the delivery without requeueing it.
    pub async fn reject(self) -> Result<()> {
        self.acker.reject().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("body_len", &self.body.len())
            .field("headers", &self.headers)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}
