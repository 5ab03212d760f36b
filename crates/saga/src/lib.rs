//! Order fulfillment saga handlers.
//!
//! Three consumers drive an order through its lifecycle:
//! 1. [`CreateOrderHandler`] persists a `Processing` order under a deadline
//!    and forwards it downstream.
//! 2. [`RollbackHandler`] marks an order with a caller-supplied status.
//! 3. [`CompletionHandler`] marks an order `Success`, and on any fault
//!    re-publishes the original message to the delivery-failure queue.
//!
//! Every hop opens a child span of the trace carried in the message
//! (see [`trace`]) and injects its own span into whatever it publishes.

pub mod error;
pub mod handlers;
pub mod messages;
pub mod options;
pub mod outcome;
pub mod trace;

pub use error::{Result, SagaError};
pub use handlers::{CompletionHandler, CreateOrderHandler, MessageHandler, RollbackHandler};
pub use messages::{CompleteRequest, CreateOrderRequest, OrderCreated, RollbackRequest};
pub use options::{CreateFailurePolicy, HandlerOptions};
pub use outcome::{
    CompletionOutcome, CompletionResult, CreateOutcome, CreateStage, Disposition, FaultReason,
    RollbackOutcome,
};
pub use trace::{HopSpan, TraceCarrier, Tracer};
