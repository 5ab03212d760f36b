use std::sync::Arc;

use async_trait::async_trait;
use order_store::{OrderStore, StatusUpdate};
use tracing::Instrument;
use transport::queues::RB_ORDER;

use crate::handlers::MessageHandler;
use crate::messages;
use crate::options::HandlerOptions;
use crate::outcome::{Disposition, RollbackOutcome};
use crate::trace::Tracer;
use crate::{Result, SagaError};

/// Records the status a downstream rollback reports for an order.
///
/// The status defaults to `Unknown`. Replaying a rollback leaves the same
/// final status, so broker redeliveries are harmless.
pub struct RollbackHandler<S: ?Sized> {
    store: Arc<S>,
    tracer: Tracer,
    options: HandlerOptions,
}

impl<S> RollbackHandler<S>
where
    S: OrderStore + ?Sized,
{
    pub fn new(store: Arc<S>, tracer: Tracer, options: HandlerOptions) -> Self {
        Self {
            store,
            tracer,
            options,
        }
    }

    /// Handles one `rb.order` body. Malformed bodies and store failures are
    /// errors; an unknown order number is not.
    pub async fn handle_rollback(&self, body: &[u8]) -> Result<RollbackOutcome> {
        let request = messages::parse_rollback(body).inspect_err(|e| {
            tracing::warn!(error = %e, "malformed rollback request");
            metrics::counter!("order_rollbacks_total", "outcome" => "malformed").increment(1);
        })?;

        let hop = self
            .tracer
            .start_span("rollback-order", request.trace_parent.as_ref());
        let order_id = request.order_number;
        let status = request.target_status();

        async {
            let update = self
                .store
                .update_status(order_id, status, self.options.status_guard)
                .await
                .inspect_err(|e| {
                    tracing::error!(%order_id, error = %e, "rollback status update failed");
                    metrics::counter!("order_rollbacks_total", "outcome" => "error").increment(1);
                })?;

            let outcome = match update {
                StatusUpdate::Updated { previous } => {
                    tracing::info!(%order_id, %previous, %status, "order rolled back");
                    RollbackOutcome::Updated {
                        order_id,
                        status,
                        previous,
                    }
                }
                StatusUpdate::Skipped { current } => {
                    tracing::info!(
                        %order_id,
                        %current,
                        requested = %status,
                        "rollback skipped, order already terminal"
                    );
                    RollbackOutcome::Skipped { order_id, current }
                }
                StatusUpdate::NotFound => {
                    tracing::warn!(%order_id, "rollback for unknown order");
                    RollbackOutcome::NotFound { order_id }
                }
            };
            metrics::counter!("order_rollbacks_total", "outcome" => outcome_label(&outcome))
                .increment(1);
            Ok::<_, SagaError>(outcome)
        }
        .instrument(hop.tracing_span())
        .await
    }
}

fn outcome_label(outcome: &RollbackOutcome) -> &'static str {
    match outcome {
        RollbackOutcome::Updated { .. } => "updated",
        RollbackOutcome::Skipped { .. } => "skipped",
        RollbackOutcome::NotFound { .. } => "not_found",
    }
}

#[async_trait]
impl<S> MessageHandler for RollbackHandler<S>
where
    S: OrderStore + ?Sized,
{
    fn queue(&self) -> &'static str {
        RB_ORDER
    }

    async fn handle(&self, body: &[u8]) -> Result<Disposition> {
        self.handle_rollback(body).await?;
        Ok(Disposition::Ack)
    }
}

#[cfg(test)]
mod tests {
    use common::{OrderId, OrderStatus};
    use order_store::{InMemoryOrderStore, NewOrder, OrderStoreExt, StatusGuard};

    use super::*;

    async fn store_with_order() -> (InMemoryOrderStore, OrderId) {
        let store = InMemoryOrderStore::new();
        let order = store.create(NewOrder::new("alice", 3)).await.unwrap();
        (store, order.id)
    }

    fn handler(
        store: &InMemoryOrderStore,
        options: HandlerOptions,
    ) -> RollbackHandler<InMemoryOrderStore> {
        RollbackHandler::new(Arc::new(store.clone()), Tracer::new(), options)
    }

    #[tokio::test]
    async fn test_rollback_defaults_to_unknown() {
        let (store, id) = store_with_order().await;
        let handler = handler(&store, HandlerOptions::default());

        let body = format!(r#"{{"order_number":{id}}}"#);
        let outcome = handler.handle_rollback(body.as_bytes()).await.unwrap();

        assert_eq!(
            outcome,
            RollbackOutcome::Updated {
                order_id: id,
                status: OrderStatus::Unknown,
                previous: OrderStatus::Processing,
            }
        );
        let order = store.get(id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Unknown);
    }

    #[tokio::test]
    async fn test_rollback_uses_supplied_status() {
        let (store, id) = store_with_order().await;
        let handler = handler(&store, HandlerOptions::default());

        let body = format!(r#"{{"order_number":{id},"status":"RolledBack"}}"#);
        handler.handle_rollback(body.as_bytes()).await.unwrap();

        let order = store.get(id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::RolledBack);
    }

    #[tokio::test]
    async fn test_rollback_replay_is_idempotent() {
        let (store, id) = store_with_order().await;
        let handler = handler(&store, HandlerOptions::default());
        let body = format!(r#"{{"order_number":{id},"status":"RolledBack"}}"#);

        handler.handle_rollback(body.as_bytes()).await.unwrap();
        handler.handle_rollback(body.as_bytes()).await.unwrap();

        let order = store.get(id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::RolledBack);
    }

    #[tokio::test]
    async fn test_unknown_order_is_acknowledged() {
        let store = InMemoryOrderStore::new();
        let handler = handler(&store, HandlerOptions::default());

        let outcome = handler.handle_rollback(br#"{"order_number":99}"#).await.unwrap();
        assert_eq!(
            outcome,
            RollbackOutcome::NotFound {
                order_id: OrderId::new(99)
            }
        );
        assert_eq!(
            handler.handle(br#"{"order_number":99}"#).await.unwrap(),
            Disposition::Ack
        );
    }

    #[tokio::test]
    async fn test_malformed_rollback_is_an_error() {
        let store = InMemoryOrderStore::new();
        let handler = handler(&store, HandlerOptions::default());

        for body in [&b"{}"[..], &b"not json"[..], &br#"{"order_number":"x"}"#[..]] {
            assert!(matches!(
                handler.handle_rollback(body).await,
                Err(SagaError::Malformed(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_rollback_cannot_reopen_order() {
        let (store, id) = store_with_order().await;
        store
            .update_status(id, OrderStatus::Success, StatusGuard::Unconditional)
            .await
            .unwrap();
        let handler = handler(&store, HandlerOptions::default());

        let body = format!(r#"{{"order_number":{id},"status":"Processing"}}"#);
        assert!(matches!(
            handler.handle_rollback(body.as_bytes()).await,
            Err(SagaError::Malformed(_))
        ));

        let order = store.get(id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Success);
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let (store, id) = store_with_order().await;
        store.set_fail_on_update(true).await;
        let handler = handler(&store, HandlerOptions::default());

        let body = format!(r#"{{"order_number":{id}}}"#);
        assert!(matches!(
            handler.handle_rollback(body.as_bytes()).await,
            Err(SagaError::Store(_))
        ));
    }

    #[tokio::test]
    async fn test_guard_keeps_terminal_status() {
        let (store, id) = store_with_order().await;
        store
            .update_status(id, OrderStatus::Success, StatusGuard::Unconditional)
            .await
            .unwrap();
        let handler = handler(
            &store,
            HandlerOptions::default().with_status_guard(StatusGuard::FromProcessingOnly),
        );

        let body = format!(r#"{{"order_number":{id}}}"#);
        let outcome = handler.handle_rollback(body.as_bytes()).await.unwrap();

        assert_eq!(
            outcome,
            RollbackOutcome::Skipped {
                order_id: id,
                current: OrderStatus::Success
            }
        );
        let order = store.get(id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Success);
    }
}
