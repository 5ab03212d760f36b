use std::sync::Arc;

use async_trait::async_trait;
use common::OrderStatus;
use order_store::{OrderStore, StatusUpdate};
use tracing::Instrument;
use transport::queues::{RB_DELIVER, TO_ORDER_COMPLETE};
use transport::{OutboundMessage, Publisher};

use crate::handlers::MessageHandler;
use crate::messages::{self, CompleteRequest};
use crate::options::HandlerOptions;
use crate::outcome::{CompletionOutcome, CompletionResult, Disposition, FaultReason};
use crate::trace::Tracer;
use crate::{Result, SagaError};

/// Marks orders `Success`, compensating when that is not possible.
///
/// Handling happens in two explicit steps. [`CompletionHandler::try_complete`]
/// attempts the status update and reports a [`CompletionOutcome`]. On a
/// fault, [`CompletionHandler::compensate`] re-publishes the original body,
/// byte for byte, to `rb.deliver` so downstream can undo the delivery.
pub struct CompletionHandler<S: ?Sized, P: ?Sized> {
    store: Arc<S>,
    publisher: Arc<P>,
    tracer: Tracer,
    options: HandlerOptions,
}

impl<S, P> CompletionHandler<S, P>
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

    /// Handles one `to.order.complete` body.
    ///
    /// Only a failed compensating publish is an error; every other fault
    /// ends in [`CompletionResult::Compensated`].
    pub async fn handle_complete(&self, body: &[u8]) -> Result<CompletionResult> {
        match self.try_complete(body).await {
            CompletionOutcome::Success(order_id) => {
                metrics::counter!("order_completions_total", "outcome" => "success").increment(1);
                Ok(CompletionResult::Completed(order_id))
            }
            CompletionOutcome::Fault(reason) => {
                metrics::counter!("order_completions_total", "outcome" => reason.label())
                    .increment(1);
                self.compensate(body, reason).await
            }
        }
    }

    /// Attempts to mark the order `Success`.
    pub async fn try_complete(&self, body: &[u8]) -> CompletionOutcome {
        let request: CompleteRequest = match messages::parse(body) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "malformed completion");
                return CompletionOutcome::Fault(FaultReason::Malformed(e.to_string()));
            }
        };

        let hop = self
            .tracer
            .start_span("complete-order", request.trace_parent.as_ref());
        let order_id = request.order_number;

        async {
            let update = self
                .store
                .update_status(order_id, OrderStatus::Success, self.options.status_guard)
                .await;

            match update {
                Ok(StatusUpdate::Updated { previous }) => {
                    tracing::info!(%order_id, %previous, "order completed");
                    CompletionOutcome::Success(order_id)
                }
                // A replayed completion for an order that already succeeded.
                Ok(StatusUpdate::Skipped {
                    current: OrderStatus::Success,
                }) => CompletionOutcome::Success(order_id),
                Ok(StatusUpdate::Skipped { current }) => {
                    tracing::warn!(
                        %order_id,
                        %current,
                        "completion refused, order already terminal"
                    );
                    CompletionOutcome::Fault(FaultReason::Terminal { order_id, current })
                }
                Ok(StatusUpdate::NotFound) => {
                    tracing::warn!(%order_id, "completion for unknown order");
                    CompletionOutcome::Fault(FaultReason::NotFound(order_id))
                }
                Err(e) => {
                    tracing::error!(%order_id, error = %e, "completion status update failed");
                    CompletionOutcome::Fault(FaultReason::Store(e.to_string()))
                }
            }
        }
        .instrument(hop.tracing_span())
        .await
    }

    /// Publishes `body` unchanged to `rb.deliver`.
    ///
    /// A fresh `compensate-order` span, child of whatever trace the body
    /// carries, travels in the message headers. A body that is not JSON at
    /// all is still published, without trace headers.
    pub async fn compensate(&self, body: &[u8], reason: FaultReason) -> Result<CompletionResult> {
        let traced = serde_json::from_slice::<serde_json::Value>(body).is_ok();
        let mut message = OutboundMessage::new(body.to_vec());

        let span = if traced {
            let carrier = messages::sniff_trace_parent(body);
            let hop = self.tracer.start_span("compensate-order", carrier.as_ref());
            message = message.with_headers(self.tracer.inject(&hop).into_headers());
            hop.tracing_span()
        } else {
            tracing::info_span!("compensate-order", degraded = true)
        };

        async {
            self.publisher
                .publish(RB_DELIVER, message)
                .await
                .inspect_err(|e| tracing::error!(error = %e, "compensating publish failed"))?;

            metrics::counter!(
                "order_compensations_total",
                "degraded" => if traced { "false" } else { "true" }
            )
            .increment(1);
            tracing::warn!(%reason, traced, queue = RB_DELIVER, "completion compensated");
            Ok::<_, SagaError>(CompletionResult::Compensated { reason, traced })
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl<S, P> MessageHandler for CompletionHandler<S, P>
where
    S: OrderStore + ?Sized,
    P: Publisher + ?Sized,
{
    fn queue(&self) -> &'static str {
        TO_ORDER_COMPLETE
    }

    async fn handle(&self, body: &[u8]) -> Result<Disposition> {
        self.handle_complete(body).await?;
        Ok(Disposition::Ack)
    }
}
