use async_trait::async_trait;

use crate::{NewOrder, Order, OrderId, OrderStatus, Result};

/// Precondition applied to a status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusGuard {
    /// Overwrite whatever status the row has (last writer wins).
    #[default]
    Unconditional,
    /// Only move the row out of `Processing`; terminal rows are left alone.
    FromProcessingOnly,
}

/// What a status update did to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    /// The row now carries the requested status.
    Updated { previous: OrderStatus },
    /// The guard refused the transition; the row keeps `current`.
    Skipped { current: OrderStatus },
    /// No row has this ID.
    NotFound,
}

/// A unit of work against the order table.
///
/// Dropping a transaction without calling [`OrderTransaction::commit`]
/// discards everything written through it. Deadline handling relies on
/// this: abandoning the future that owns the transaction rolls it back.
#[async_trait]
pub trait OrderTransaction: Send {
    /// Inserts a new order with status `Processing` and returns the row,
    /// including its store-assigned ID.
    async fn insert(&mut self, order: NewOrder) -> Result<Order>;

    /// Makes all writes in this transaction durable.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discards all writes in this transaction.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Core trait for order store implementations.
///
/// The store is shared between all concurrently running handlers, so
/// implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Opens a new transaction.
    async fn begin(&self) -> Result<Box<dyn OrderTransaction>>;

    /// Sets the status of an order, subject to `guard`.
    async fn update_status(
        &self,
        id: OrderId,
        status: OrderStatus,
        guard: StatusGuard,
    ) -> Result<StatusUpdate>;

    /// Retrieves a single order.
    async fn get(&self, id: OrderId) -> Result<Option<Order>>;

    /// Retrieves all orders in ID order.
    async fn list(&self) -> Result<Vec<Order>>;

    /// Drops and recreates the order table. Destroys all data.
    async fn reset_schema(&self) -> Result<()>;
}

/// Extension trait providing convenience methods for order stores.
#[async_trait]
pub trait OrderStoreExt: OrderStore {
    /// Inserts and commits a single order in its own transaction.
    async fn create(&self, order: NewOrder) -> Result<Order> {
        let mut tx = self.begin().await?;
        let created = tx.insert(order).await?;
        tx.commit().await?;
        Ok(created)
    }
}

impl<T: OrderStore + ?Sized> OrderStoreExt for T {}

/// Decides what a status update does given the row's current status.
pub(crate) fn apply_guard(
    current: OrderStatus,
    guard: StatusGuard,
) -> std::result::Result<(), StatusUpdate> {
    match guard {
        StatusGuard::Unconditional => Ok(()),
        StatusGuard::FromProcessingOnly if current == OrderStatus::Processing => Ok(()),
        StatusGuard::FromProcessingOnly => Err(StatusUpdate::Skipped { current }),
    }
}
