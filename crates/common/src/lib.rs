//! Value types shared by the order store, the message handlers and the worker.

pub mod status;
pub mod types;

pub use status::{OrderStatus, ParseStatusError};
pub use types::OrderId;
