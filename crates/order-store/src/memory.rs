use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::store::{OrderStore, OrderTransaction, StatusGuard, StatusUpdate, apply_guard};
use crate::{NewOrder, Order, OrderId, OrderStatus, Result, StoreError};

#[derive(Debug, Default)]
struct Faults {
    insert_delay: Option<Duration>,
    fail_on_begin: bool,
    fail_on_insert: bool,
    fail_on_commit: bool,
    fail_on_update: bool,
}

#[derive(Debug, Default)]
struct InMemoryState {
    orders: BTreeMap<OrderId, Order>,
    next_id: i64,
    faults: Faults,
}

/// In-memory order store implementation for testing.
///
/// Behaves like the PostgreSQL store: IDs come from a sequence that is
/// consumed even when the inserting transaction rolls back, and rows only
/// become visible on commit. Failure and latency switches simulate an
/// unhealthy database.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderStore {
    state: Arc<RwLock<InMemoryState>>,
}

impl InMemoryOrderStore {
    /// Creates a new empty in-memory order store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every insert wait for `delay` before touching the table.
    pub async fn set_insert_delay(&self, delay: Option<Duration>) {
        self.state.write().await.faults.insert_delay = delay;
    }

    /// Configures the store to fail when a transaction is opened.
    pub async fn set_fail_on_begin(&self, fail: bool) {
        self.state.write().await.faults.fail_on_begin = fail;
    }

    /// Configures the store to fail on insert.
    pub async fn set_fail_on_insert(&self, fail: bool) {
        self.state.write().await.faults.fail_on_insert = fail;
    }

    /// Configures the store to fail on commit.
    pub async fn set_fail_on_commit(&self, fail: bool) {
        self.state.write().await.faults.fail_on_commit = fail;
    }

    /// Configures the store to fail on status updates.
    pub async fn set_fail_on_update(&self, fail: bool) {
        self.state.write().await.faults.fail_on_update = fail;
    }

    /// Returns the number of committed orders.
    pub async fn order_count(&self) -> usize {
        self.state.read().await.orders.len()
    }
}

struct InMemoryTransaction {
    state: Arc<RwLock<InMemoryState>>,
    pending: Vec<Order>,
}

#[async_trait]
impl OrderTransaction for InMemoryTransaction {
    async fn insert(&mut self, order: NewOrder) -> Result<Order> {
        let delay = self.state.read().await.faults.insert_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.write().await;
        if state.faults.fail_on_insert {
            return Err(StoreError::Unavailable("insert rejected".to_string()));
        }

        state.next_id += 1;
        let now = Utc::now();
        let created = Order {
            id: OrderId::new(state.next_id),
            username: order.username,
            amount: order.amount,
            status: OrderStatus::Processing,
            created_at: now,
            updated_at: now,
        };
        self.pending.push(created.clone());
        Ok(created)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let Self { state, pending } = *self;
        let mut state = state.write().await;
        if state.faults.fail_on_commit {
            return Err(StoreError::Unavailable("commit rejected".to_string()));
        }
        for order in pending {
            state.orders.insert(order.id, order);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn begin(&self) -> Result<Box<dyn OrderTransaction>> {
        if self.state.read().await.faults.fail_on_begin {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        Ok(Box::new(InMemoryTransaction {
            state: self.state.clone(),
            pending: Vec::new(),
        }))
    }

    async fn update_status(
        &self,
        id: OrderId,
        status: OrderStatus,
        guard: StatusGuard,
    ) -> Result<StatusUpdate> {
        let mut state = self.state.write().await;
        if state.faults.fail_on_update {
            return Err(StoreError::Unavailable("update rejected".to_string()));
        }

        let Some(order) = state.orders.get_mut(&id) else {
            return Ok(StatusUpdate::NotFound);
        };
        if let Err(skipped) = apply_guard(order.status, guard) {
            return Ok(skipped);
        }

        let previous = order.status;
        order.status = status;
        order.updated_at = Utc::now();
        Ok(StatusUpdate::Updated { previous })
    }

    async fn get(&self, id: OrderId) -> Result<Option<Order>> {
        Ok(self.state.read().await.orders.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Order>> {
        Ok(self.state.read().await.orders.values().cloned().collect())
    }

    async fn reset_schema(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.orders.clear();
        state.next_id = 0;
        Ok(())
    }
}
