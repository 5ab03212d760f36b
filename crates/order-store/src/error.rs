use common::ParseStatusError;
use thiserror::Error;

/// Errors that can occur when interacting with the order store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The store could not serve the request (connection lost, injected fault).
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A row carried a status value this build does not know.
    #[error("Invalid status in store: {0}")]
    InvalidStatus(#[from] ParseStatusError),
}

/// Result type for order store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
