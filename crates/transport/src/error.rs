use thiserror::Error;

/// Errors that can occur when talking to the broker.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No connection or channel could be established.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A queue or exchange could not be declared.
    #[error("Failed to declare '{name}': {reason}")]
    Declare { name: String, reason: String },

    /// A message could not be published.
    #[error("Failed to publish to '{queue}': {reason}")]
    Publish { queue: String, reason: String },

    /// A consumer could not be started or its stream failed.
    #[error("Failed to consume from '{queue}': {reason}")]
    Consume { queue: String, reason: String },

    /// A delivery could not be acknowledged or rejected.
    #[error("Failed to settle delivery from '{queue}': {reason}")]
    Acknowledge { queue: String, reason: String },

    /// A protocol-level error from the AMQP client.
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),
}

impl TransportError {
    pub fn publish(queue: impl Into<String>, reason: impl ToString) -> Self {
        Self::Publish {
            queue: queue.into(),
            reason: reason.to_string(),
        }
    }

    pub fn consume(queue: impl Into<String>, reason: impl ToString) -> Self {
        Self::Consume {
            queue: queue.into(),
            reason: reason.to_string(),
        }
    }

    pub fn acknowledge(queue: impl Into<String>, reason: impl ToString) -> Self {
        Self::Acknowledge {
            queue: queue.into(),
            reason: reason.to_string(),
        }
    }

    pub fn declare(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Declare {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
