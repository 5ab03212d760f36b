//! Order fulfillment worker.
//!
//! Wires the saga handlers to the broker: one bounded-concurrency consumer
//! loop per inbound queue, stopped together on shutdown.

pub mod config;
pub mod consumer;
pub mod error;

use std::future::Future;
use std::sync::Arc;

use order_store::OrderStore;
use saga::{
    CompletionHandler, CreateOrderHandler, HandlerOptions, MessageHandler, RollbackHandler, Tracer,
};
use tokio::sync::watch;
use tokio::task::JoinSet;
use transport::Broker;

pub use config::{Config, LogFormat};
pub use consumer::{process_delivery, run_consumer};
pub use error::{Result, WorkerError};

/// A set of consumers sharing one broker.
pub struct Worker<B: ?Sized> {
    broker: Arc<B>,
    handlers: Vec<Arc<dyn MessageHandler>>,
    concurrency: u16,
}

impl<B> Worker<B>
where
    B: Broker + ?Sized + 'static,
{
    /// Creates a worker with no handlers.
    pub fn new(broker: Arc<B>, concurrency: u16) -> Self {
        Self {
            broker,
            handlers: Vec::new(),
            concurrency: concurrency.max(1),
        }
    }

    /// Creates a worker running the create, rollback and completion handlers.
    pub fn for_orders<S>(
        broker: Arc<B>,
        store: Arc<S>,
        tracer: Tracer,
        options: HandlerOptions,
        concurrency: u16,
    ) -> Self
    where
        S: OrderStore + ?Sized + 'static,
    {
        let create = CreateOrderHandler::new(store.clone(), broker.clone(), tracer.clone(), options);
        let rollback = RollbackHandler::new(store.clone(), tracer.clone(), options);
        let complete = CompletionHandler::new(store, broker.clone(), tracer, options);

        Self::new(broker, concurrency)
            .with_handler(Arc::new(create))
            .with_handler(Arc::new(rollback))
            .with_handler(Arc::new(complete))
    }

    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Returns the queues this worker consumes.
    pub fn queues(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.queue()).collect()
    }

    /// Starts every consumer and runs until `shutdown` resolves or a
    /// consumer fails. In-flight deliveries are settled before returning.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut consumers = JoinSet::new();

        for handler in self.handlers {
            let deliveries = self.broker.consume(handler.queue(), self.concurrency).await?;
            consumers.spawn(run_consumer(
                deliveries,
                handler,
                usize::from(self.concurrency),
                stop_rx.clone(),
            ));
        }
        drop(stop_rx);

        tracing::info!(consumers = consumers.len(), "worker running");

        let mut result = Ok(());
        tokio::select! {
            () = shutdown => {
                tracing::info!("shutdown requested, stopping consumers");
            }
            Some(joined) = consumers.join_next() => {
                tracing::warn!("a consumer stopped unexpectedly, stopping the others");
                result = flatten(joined);
            }
        }

        let _ = stop_tx.send(true);
        while let Some(joined) = consumers.join_next().await {
            if let Err(e) = flatten(joined) {
                tracing::error!(error = %e, "consumer failed");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        result
    }
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined.map_err(|e| {
        tracing::error!(error = %e, "consumer task panicked");
        WorkerError::from(e)
    })?
}
