//! Bounded-concurrency consumer loop.
//!
//! One loop runs per inbound queue. A delivery is only pulled from the
//! stream once a semaphore permit is available, so at most `concurrency`
//! handlers run at a time per queue; the broker's prefetch is set to the
//! same number so it never pushes more than that ahead of the loop.

use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use saga::{Disposition, MessageHandler};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use transport::{Delivery, DeliveryStream};

use crate::{Result, WorkerError};

/// Consumes `deliveries` with `handler` until `shutdown` flips to true or
/// the stream ends, then waits for in-flight deliveries to settle.
pub async fn run_consumer(
    mut deliveries: DeliveryStream,
    handler: Arc<dyn MessageHandler>,
    concurrency: usize,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let queue = handler.queue();
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut in_flight = JoinSet::new();
    let mut result = Ok(());

    tracing::info!(queue, concurrency, "consumer started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let permit = tokio::select! {
            _ = shutdown.changed() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let next = tokio::select! {
            _ = shutdown.changed() => break,
            next = deliveries.next() => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => {
                tracing::error!(queue, error = %e, "delivery stream failed");
                result = Err(WorkerError::from(e));
                break;
            }
            None => {
                tracing::warn!(queue, "delivery stream closed");
                break;
            }
        };

        let handler = handler.clone();
        in_flight.spawn(async move {
            process_delivery(handler.as_ref(), delivery).await;
            drop(permit);
        });

        while let Some(joined) = in_flight.try_join_next() {
            log_join_error(queue, joined);
        }
    }

    tracing::info!(queue, in_flight = in_flight.len(), "consumer stopping, draining deliveries");
    while let Some(joined) = in_flight.join_next().await {
        log_join_error(queue, joined);
    }
    tracing::info!(queue, "consumer stopped");

    result
}

/// Runs `handler` on one delivery and settles it.
///
/// `Ok(Ack)` acknowledges. `Ok(Reject)` and any error reject without
/// requeue, handing the message to the queue's dead-letter route.
pub async fn process_delivery(handler: &dyn MessageHandler, delivery: Delivery) -> Disposition {
    let queue = handler.queue();
    let start = Instant::now();

    let disposition = match handler.handle(&delivery.body).await {
        Ok(disposition) => disposition,
        Err(e) => {
            tracing::error!(
                queue,
                error = %e,
                redelivered = delivery.redelivered,
                "handler failed, rejecting delivery"
            );
            Disposition::Reject
        }
    };

    let settled = match disposition {
        Disposition::Ack => delivery.ack().await,
        Disposition::Reject => delivery.reject().await,
    };
    if let Err(e) = settled {
        tracing::error!(queue, error = %e, "failed to settle delivery");
    }

    metrics::counter!(
        "worker_messages_total",
        "queue" => queue,
        "disposition" => disposition.as_str()
    )
    .increment(1);
    metrics::histogram!("worker_message_duration_seconds", "queue" => queue)
        .record(start.elapsed().as_secs_f64());

    disposition
}

fn log_join_error(queue: &str, joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(queue, error = %e, "delivery task panicked");
    }
}
