//! Message handlers, one per inbound queue.

mod complete;
mod create;
mod rollback;

pub use complete::CompletionHandler;
pub use create::CreateOrderHandler;
pub use rollback::RollbackHandler;

use async_trait::async_trait;

use crate::{Disposition, Result};

/// A consumer of one inbound queue.
///
/// The worker feeds every delivery body from [`MessageHandler::queue`] to
/// [`MessageHandler::handle`] and settles the delivery from the result: an
/// `Err` is treated like [`Disposition::Reject`].
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// The queue this handler consumes.
    fn queue(&self) -> &'static str;

    async fn handle(&self, body: &[u8]) -> Result<Disposition>;
}
