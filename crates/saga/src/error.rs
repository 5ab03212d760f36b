//! Saga error types.

use order_store::StoreError;
use thiserror::Error;
use transport::TransportError;

/// Errors that escape a handler.
///
/// A handler returning one of these leaves its delivery unacknowledged; the
/// worker rejects it and the broker's dead-letter policy takes over.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The message body could not be parsed or failed validation.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Order store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Message transport error.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// An outbound message could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
