use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};

use crate::broker::{Broker, DeliveryStream, Publisher};
use crate::{Acknowledger, Delivery, OutboundMessage, QueueSpec, Result, TransportError};

#[derive(Debug, Default)]
struct InMemoryState {
    declared: HashMap<String, QueueSpec>,
    published: HashMap<String, Vec<OutboundMessage>>,
    backlog: HashMap<String, VecDeque<OutboundMessage>>,
    consumers: HashMap<String, mpsc::UnboundedSender<Delivery>>,
    acked: HashMap<String, Vec<Vec<u8>>>,
    rejected: HashMap<String, Vec<Vec<u8>>>,
    fail_on_publish: HashSet<String>,
}

/// In-memory broker for testing.
///
/// Publishing records the message and hands it to the queue's consumer, or
/// holds it until one subscribes. Rejected deliveries follow the queue's
/// declared dead-letter route. Prefetch is not modelled; callers bound
/// their own concurrency.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransport {
    state: Arc<RwLock<InMemoryState>>,
}

impl InMemoryTransport {
    /// Creates a new empty in-memory transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures publishes to `queue` to fail.
    pub async fn set_fail_on_publish(&self, queue: &str, fail: bool) {
        let mut state = self.state.write().await;
        if fail {
            state.fail_on_publish.insert(queue.to_string());
        } else {
            state.fail_on_publish.remove(queue);
        }
    }

    /// Puts a raw body on `queue`, bypassing publish faults.
    pub async fn deliver(&self, queue: &str, body: impl Into<Vec<u8>>) {
        let mut state = self.state.write().await;
        route(&self.state, &mut state, queue, OutboundMessage::new(body));
    }

    /// Returns every message published (or delivered) to `queue`, in order.
    pub async fn published(&self, queue: &str) -> Vec<OutboundMessage> {
        self.state
            .read()
            .await
            .published
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the bodies of acknowledged deliveries from `queue`.
    pub async fn acked(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state
            .read()
            .await
            .acked
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the bodies of rejected deliveries from `queue`.
    pub async fn rejected(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state
            .read()
            .await
            .rejected
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the specs of all declared queues.
    pub async fn declared(&self) -> Vec<QueueSpec> {
        self.state.read().await.declared.values().cloned().collect()
    }
}

fn route(
    handle: &Arc<RwLock<InMemoryState>>,
    state: &mut InMemoryState,
    queue: &str,
    message: OutboundMessage,
) {
    state
        .published
        .entry(queue.to_string())
        .or_default()
        .push(message.clone());

    if let Some(consumer) = state.consumers.get(queue) {
        if consumer
            .send(to_delivery(handle, queue, message.clone()))
            .is_ok()
        {
            return;
        }
        // Consumer went away; keep the message for the next one.
        state.consumers.remove(queue);
    }
    state
        .backlog
        .entry(queue.to_string())
        .or_default()
        .push_back(message);
}

fn to_delivery(
    handle: &Arc<RwLock<InMemoryState>>,
    queue: &str,
    message: OutboundMessage,
) -> Delivery {
    let acker = InMemoryAcker {
        state: handle.clone(),
        queue: queue.to_string(),
        body: message.body.clone(),
    };
    Delivery::new(queue, message.body, message.headers, false, Box::new(acker))
}

struct InMemoryAcker {
    state: Arc<RwLock<InMemoryState>>,
    queue: String,
    body: Vec<u8>,
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .acked
            .entry(self.queue.clone())
            .or_default()
            .push(self.body.clone());
        Ok(())
    }

    async fn reject(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .rejected
            .entry(self.queue.clone())
            .or_default()
            .push(self.body.clone());

        let dead_letter = state
            .declared
            .get(&self.queue)
            .and_then(|spec| spec.dead_letter.clone());
        if let Some(dead_letter) = dead_letter {
            route(
                &self.state,
                &mut state,
                &dead_letter.queue,
                OutboundMessage::new(self.body.clone()),
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Publisher for InMemoryTransport {
    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<()> {
        let mut state = self.state.write().await;
        if state.fail_on_publish.contains(queue) {
            return Err(TransportError::publish(queue, "broker unavailable"));
        }
        route(&self.state, &mut state, queue, message);
        Ok(())
    }
}

#[async_trait]
impl Broker for InMemoryTransport {
    async fn declare(&self, spec: &QueueSpec) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(dead_letter) = &spec.dead_letter {
            state
                .declared
                .entry(dead_letter.queue.clone())
                .or_insert_with(|| QueueSpec::new(dead_letter.queue.clone()));
        }
        state.declared.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn consume(&self, queue: &str, _prefetch: u16) -> Result<DeliveryStream> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.state.write().await;
        if state.consumers.contains_key(queue) {
            return Err(TransportError::consume(queue, "queue already has a consumer"));
        }
        let backlog = state.backlog.remove(queue).unwrap_or_default();
        for message in backlog {
            let _ = tx.send(to_delivery(&self.state, queue, message));
        }
        state.consumers.insert(queue.to_string(), tx);

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (Ok(delivery), rx))
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;
    use crate::DeadLetter;

    #[tokio::test]
    async fn test_publish_is_recorded_and_delivered() {
        let transport = InMemoryTransport::new();
        let mut stream = transport.consume("q", 1).await.unwrap();

        transport
            .publish("q", OutboundMessage::new(b"hello".to_vec()))
            .await
            .unwrap();

        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.body, b"hello");
        assert_eq!(transport.published("q").await.len(), 1);

        delivery.ack().await.unwrap();
        assert_eq!(transport.acked("q").await, vec![b"hello".to_vec()]);
    }

    #[tokio::test]
    async fn test_backlog_is_drained_on_consume() {
        let transport = InMemoryTransport::new();
        transport.deliver("q", b"first".to_vec()).await;
        transport.deliver("q", b"second".to_vec()).await;

        let mut stream = transport.consume("q", 1).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();

        assert_eq!(first.body, b"first");
        assert_eq!(second.body, b"second");
    }

    #[tokio::test]
    async fn test_reject_routes_to_dead_letter() {
        let transport = InMemoryTransport::new();
        transport
            .declare(&QueueSpec::new("q").with_dead_letter(DeadLetter::default()))
            .await
            .unwrap();

        transport.deliver("q", b"bad".to_vec()).await;
        let mut stream = transport.consume("q", 1).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        delivery.reject().await.unwrap();

        assert_eq!(transport.rejected("q").await, vec![b"bad".to_vec()]);
        let dead = transport.published("dead.letter").await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body, b"bad");
    }

    #[tokio::test]
    async fn test_reject_without_dead_letter_drops() {
        let transport = InMemoryTransport::new();
        transport.deliver("q", b"bad".to_vec()).await;

        let mut stream = transport.consume("q", 1).await.unwrap();
        stream.next().await.unwrap().unwrap().reject().await.unwrap();

        assert!(transport.published("dead.letter").await.is_empty());
    }

    #[tokio::test]
    async fn test_fail_on_publish_is_per_queue() {
        let transport = InMemoryTransport::new();
        transport.set_fail_on_publish("broken", true).await;

        let err = transport
            .publish("broken", OutboundMessage::new(b"x".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Publish { .. }));
        assert!(transport.published("broken").await.is_empty());

        transport
            .publish("fine", OutboundMessage::new(b"x".to_vec()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_declare_registers_dead_letter_queue() {
        let transport = InMemoryTransport::new();
        transport
            .declare(&QueueSpec::new("q").with_dead_letter(DeadLetter::default()))
            .await
            .unwrap();

        let mut names: Vec<_> = transport
            .declared()
            .await
            .into_iter()
            .map(|s| s.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["dead.letter", "q"]);
    }
}
