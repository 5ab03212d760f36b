use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use order_store::{NewOrder, OrderStore, StoreError};
use tracing::Instrument;
use transport::queues::{FROM_ORDER, TO_ORDER};
use transport::{OutboundMessage, Publisher};

use crate::handlers::MessageHandler;
use crate::messages::{self, CreateOrderRequest, OrderCreated};
use crate::options::HandlerOptions;
use crate::outcome::{CreateOutcome, CreateStage, Disposition};
use crate::trace::{HopSpan, Tracer};
use crate::{Result, SagaError};

/// Persists new orders and forwards them downstream.
///
/// For each request the handler, under one deadline:
/// 1. opens a transaction and inserts a `Processing` row
/// 2. publishes [`OrderCreated`] with the assigned order number to `from.order`
/// 3. commits
///
/// The publish happens before the commit. If the commit then fails, the
/// downstream message names a row that was never made durable; this is
/// reported as [`CreateOutcome::Failed`] at [`CreateStage::Commit`]. A
/// deadline that runs out once the publish has started is reported as
/// [`CreateOutcome::DeadlineExceeded`] with `after_publish` set.
pub struct CreateOrderHandler<S: ?Sized, P: ?Sized> {
    store: Arc<S>,
    publisher: Arc<P>,
    tracer: Tracer,
    options: HandlerOptions,
}

impl<S, P> CreateOrderHandler<S, P>
where
    S: OrderStore + ?Sized,
    P: Publisher + ?Sized,
{
    pub fn new(store: Arc<S>, publisher: Arc<P>, tracer: Tracer, options: HandlerOptions) -> Self {
        Self {
            store,
            publisher,
            tracer,
            options,
        }
    }

    /// Handles one `to.order` body.
    ///
    /// Store failures and an exceeded deadline are outcomes, not errors. A
    /// failed publish is an error: the transaction is rolled back and the
    /// caller should reject the delivery.
    pub async fn handle_create(&self, body: &[u8]) -> Result<CreateOutcome> {
        let request = match messages::parse_create(body) {
            Ok(request) => request,
            Err(SagaError::Malformed(reason)) => {
                tracing::warn!(%reason, "discarding malformed create request");
                metrics::counter!("order_create_failures_total", "reason" => "malformed")
                    .increment(1);
                return Ok(CreateOutcome::Malformed { reason });
            }
            Err(e) => return Err(e),
        };

        let hop = self
            .tracer
            .start_span("create-order", request.trace_parent.as_ref());
        let span = hop.tracing_span();

        async {
            let start = Instant::now();
            let deadline = self.options.create_deadline;
            let publishing = AtomicBool::new(false);

            let outcome = match tokio::time::timeout(
                deadline,
                self.persist_and_forward(&request, &hop, &publishing),
            )
            .await
            {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "create request failed to publish");
                    metrics::counter!("order_create_failures_total", "reason" => "transport")
                        .increment(1);
                    return Err(e);
                }
                Err(_) => CreateOutcome::DeadlineExceeded {
                    deadline,
                    after_publish: publishing.load(Ordering::SeqCst),
                },
            };

            match &outcome {
                CreateOutcome::Forwarded { order_id } => {
                    metrics::counter!("orders_created_total").increment(1);
                    metrics::histogram!("order_create_duration_seconds")
                        .record(start.elapsed().as_secs_f64());
                    tracing::info!(order_id = %order_id, "order created and forwarded");
                }
                CreateOutcome::Failed { stage, reason } => {
                    metrics::counter!("order_create_failures_total", "reason" => stage.as_str())
                        .increment(1);
                    tracing::error!(stage = stage.as_str(), %reason, "order creation failed");
                }
                CreateOutcome::DeadlineExceeded {
                    deadline,
                    after_publish: false,
                } => {
                    metrics::counter!("order_create_failures_total", "reason" => "deadline")
                        .increment(1);
                    tracing::warn!(
                        deadline_ms = deadline.as_millis() as u64,
                        "order creation exceeded its deadline, transaction rolled back"
                    );
                }
                CreateOutcome::DeadlineExceeded {
                    deadline,
                    after_publish: true,
                } => {
                    metrics::counter!(
                        "order_create_failures_total",
                        "reason" => "deadline_after_publish"
                    )
                    .increment(1);
                    tracing::error!(
                        deadline_ms = deadline.as_millis() as u64,
                        "order creation exceeded its deadline after OrderCreated was published, \
                         transaction rolled back"
                    );
                }
                CreateOutcome::Malformed { .. } => {}
            }

            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    /// Runs begin, insert, publish and commit. Dropping this future before
    /// the commit drops the transaction, which rolls it back.
    ///
    /// `publishing` is set just before the publish is attempted.
    async fn persist_and_forward(
        &self,
        request: &CreateOrderRequest,
        hop: &HopSpan,
        publishing: &AtomicBool,
    ) -> Result<CreateOutcome> {
        let mut tx = match self.store.begin().await {
            Ok(tx) => tx,
            Err(e) => return Ok(failed(CreateStage::Begin, &e)),
        };

        let order = match tx
            .insert(NewOrder::new(request.username.clone(), request.amount))
            .await
        {
            Ok(order) => order,
            Err(e) => return Ok(failed(CreateStage::Insert, &e)),
        };
        tracing::debug!(order_id = %order.id, "order row inserted");

        let created = OrderCreated {
            username: order.username.clone(),
            amount: order.amount,
            order_number: order.id,
            trace_parent: self.tracer.inject(hop),
        };
        let published = match serde_json::to_vec(&created) {
            Ok(body) => {
                publishing.store(true, Ordering::SeqCst);
                self.publisher
                    .publish(FROM_ORDER, OutboundMessage::new(body))
                    .await
                    .map_err(SagaError::from)
            }
            Err(e) => Err(SagaError::from(e)),
        };
        if let Err(e) = published {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(error = %rollback_err, "rollback after failed publish also failed");
            }
            return Err(e);
        }

        if let Err(e) = tx.commit().await {
            tracing::error!(
                order_id = %order.id,
                "commit failed after OrderCreated was published"
            );
            return Ok(failed(CreateStage::Commit, &e));
        }

        Ok(CreateOutcome::Forwarded { order_id: order.id })
    }
}

fn failed(stage: CreateStage, error: &StoreError) -> CreateOutcome {
    CreateOutcome::Failed {
        stage,
        reason: error.to_string(),
    }
}

#[async_trait]
impl<S, P> MessageHandler for CreateOrderHandler<S, P>
where
    S: OrderStore + ?Sized,
    P: Publisher + ?Sized,
{
    fn queue(&self) -> &'static str {
        TO_ORDER
    }

    async fn handle(&self, body: &[u8]) -> Result<Disposition> {
        let outcome = self.handle_create(body).await?;
        Ok(outcome.disposition(self.options.create_failure_policy))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use common::{OrderId, OrderStatus};
    use order_store::InMemoryOrderStore;
    use transport::InMemoryTransport;

    use super::*;
    use crate::options::CreateFailurePolicy;

    fn handler(
        store: &InMemoryOrderStore,
        transport: &InMemoryTransport,
        options: HandlerOptions,
    ) -> CreateOrderHandler<InMemoryOrderStore, InMemoryTransport> {
        CreateOrderHandler::new(
            Arc::new(store.clone()),
            Arc::new(transport.clone()),
            Tracer::new(),
            options,
        )
    }

    #[tokio::test]
    async fn test_create_persists_and_forwards() {
        let store = InMemoryOrderStore::new();
        let transport = InMemoryTransport::new();
        let handler = handler(&store, &transport, HandlerOptions::default());

        let outcome = handler
            .handle_create(br#"{"username":"alice","amount":3}"#)
            .await
            .unwrap();

        let CreateOutcome::Forwarded { order_id } = outcome else {
            panic!("expected Forwarded, got {outcome:?}");
        };
        let order = store.get(order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Processing);
        assert_eq!(order.username, "alice");
        assert_eq!(order.amount, 3);

        let published = transport.published(FROM_ORDER).await;
        assert_eq!(published.len(), 1);
        let created: OrderCreated = serde_json::from_slice(&published[0].body).unwrap();
        assert_eq!(created.order_number, order_id);
        assert_eq!(created.username, "alice");
        assert_eq!(created.amount, 3);
        assert!(created.trace_parent.header("traceparent").is_some());
    }

    #[tokio::test]
    async fn test_malformed_request_has_no_side_effects() {
        let store = InMemoryOrderStore::new();
        let transport = InMemoryTransport::new();
        let handler = handler(&store, &transport, HandlerOptions::default());

        let outcome = handler
            .handle_create(br#"{"username":"","amount":3}"#)
            .await
            .unwrap();

        assert!(matches!(outcome, CreateOutcome::Malformed { .. }));
        assert_eq!(store.order_count().await, 0);
        assert!(transport.published(FROM_ORDER).await.is_empty());
    }

    #[tokio::test]
    async fn test_insert_failure_publishes_nothing() {
        let store = InMemoryOrderStore::new();
        store.set_fail_on_insert(true).await;
        let transport = InMemoryTransport::new();
        let handler = handler(&store, &transport, HandlerOptions::default());

        let outcome = handler
            .handle_create(br#"{"username":"bob","amount":1}"#)
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            CreateOutcome::Failed {
                stage: CreateStage::Insert,
                ..
            }
        ));
        assert_eq!(store.order_count().await, 0);
        assert!(transport.published(FROM_ORDER).await.is_empty());
    }

    #[tokio::test]
    async fn test_begin_failure_is_reported() {
        let store = InMemoryOrderStore::new();
        store.set_fail_on_begin(true).await;
        let transport = InMemoryTransport::new();
        let handler = handler(&store, &transport, HandlerOptions::default());

        let outcome = handler
            .handle_create(br#"{"username":"bob","amount":1}"#)
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            CreateOutcome::Failed {
                stage: CreateStage::Begin,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_commit_failure_after_publish() {
        let store = InMemoryOrderStore::new();
        store.set_fail_on_commit(true).await;
        let transport = InMemoryTransport::new();
        let handler = handler(&store, &transport, HandlerOptions::default());

        let outcome = handler
            .handle_create(br#"{"username":"carol","amount":2}"#)
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            CreateOutcome::Failed {
                stage: CreateStage::Commit,
                ..
            }
        ));
        assert_eq!(store.order_count().await, 0);
        assert_eq!(transport.published(FROM_ORDER).await.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_rolls_back_and_propagates() {
        let store = InMemoryOrderStore::new();
        let transport = InMemoryTransport::new();
        transport.set_fail_on_publish(FROM_ORDER, true).await;
        let handler = handler(&store, &transport, HandlerOptions::default());

        let err = handler
            .handle_create(br#"{"username":"dave","amount":4}"#)
            .await
            .unwrap_err();

        assert!(matches!(err, SagaError::Transport(_)));
        assert_eq!(store.order_count().await, 0);
    }

    #[tokio::test]
    async fn test_deadline_exceeded_rolls_back() {
        let store = InMemoryOrderStore::new();
        store
            .set_insert_delay(Some(Duration::from_millis(500)))
            .await;
        let transport = InMemoryTransport::new();
        let options = HandlerOptions::default().with_create_deadline(Duration::from_millis(50));
        let handler = handler(&store, &transport, options);

        let outcome = handler
            .handle_create(br#"{"username":"erin","amount":5}"#)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            CreateOutcome::DeadlineExceeded {
                deadline: Duration::from_millis(50),
                after_publish: false,
            }
        );
        assert_eq!(store.order_count().await, 0);
        assert!(transport.published(FROM_ORDER).await.is_empty());
    }

    /// Hands the message to the in-memory transport, then stalls as a
    /// broker confirm would.
    struct StallingPublisher {
        inner: InMemoryTransport,
        stall: Duration,
    }

    #[async_trait]
    impl Publisher for StallingPublisher {
        async fn publish(&self, queue: &str, message: OutboundMessage) -> transport::Result<()> {
            self.inner.publish(queue, message).await?;
            tokio::time::sleep(self.stall).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_deadline_after_publish_is_reported() {
        let store = InMemoryOrderStore::new();
        let transport = InMemoryTransport::new();
        let publisher = StallingPublisher {
            inner: transport.clone(),
            stall: Duration::from_millis(300),
        };
        let handler = CreateOrderHandler::new(
            Arc::new(store.clone()),
            Arc::new(publisher),
            Tracer::new(),
            HandlerOptions::default().with_create_deadline(Duration::from_millis(50)),
        );

        let outcome = handler
            .handle_create(br#"{"username":"hana","amount":2}"#)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            CreateOutcome::DeadlineExceeded {
                deadline: Duration::from_millis(50),
                after_publish: true,
            }
        );
        assert_eq!(store.order_count().await, 0);
        assert_eq!(transport.published(FROM_ORDER).await.len(), 1);
    }

    #[tokio::test]
    async fn test_disposition_follows_policy() {
        let store = InMemoryOrderStore::new();
        let transport = InMemoryTransport::new();

        let drop = handler(&store, &transport, HandlerOptions::default());
        assert_eq!(drop.handle(b"{}").await.unwrap(), Disposition::Ack);

        let dead_letter = handler(
            &store,
            &transport,
            HandlerOptions::default().with_create_failure_policy(CreateFailurePolicy::DeadLetter),
        );
        assert_eq!(dead_letter.handle(b"{}").await.unwrap(), Disposition::Reject);
        assert_eq!(
            dead_letter
                .handle(br#"{"username":"frank","amount":1}"#)
                .await
                .unwrap(),
            Disposition::Ack
        );
    }

    #[tokio::test]
    async fn test_order_numbers_are_distinct() {
        let store = InMemoryOrderStore::new();
        let transport = InMemoryTransport::new();
        let handler = handler(&store, &transport, HandlerOptions::default());

        let mut ids = Vec::new();
        for _ in 0..3 {
            if let CreateOutcome::Forwarded { order_id } = handler
                .handle_create(br#"{"username":"gina","amount":1}"#)
                .await
                .unwrap()
            {
                ids.push(order_id);
            }
        }
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert!(ids.iter().all(|id| *id > OrderId::new(0)));
    }
}
