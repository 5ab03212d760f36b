//! Worker error types.

use order_store::StoreError;
use saga::SagaError;
use thiserror::Error;
use transport::TransportError;

/// Errors that stop the worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// An environment variable held an invalid value.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Saga error: {0}")]
    Saga(#[from] SagaError),

    /// A consumer task panicked or was cancelled.
    #[error("Consumer task failed: {0}")]
    Consumer(#[from] tokio::task::JoinError),

    /// The Prometheus recorder or its listener could not be installed.
    #[error("Metrics error: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
}

/// Convenience type alias for worker results.
pub type Result<T> = std::result::Result<T, WorkerError>;
