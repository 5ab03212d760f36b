use chrono::{DateTime, Utc};
use common::{OrderId, OrderStatus};

/// A persisted order row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    /// Store-assigned identifier.
    pub id: OrderId,
    /// Who requested the order.
    pub username: String,
    /// Requested quantity, always positive.
    pub amount: i64,
    /// Current status.
    pub status: OrderStatus,
    /// When the row was inserted.
    pub created_at: DateTime<Utc>,
    /// When the status last changed.
    pub updated_at: DateTime<Utc>,
}

/// Attributes of an order that has not been inserted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrder {
    pub username: String,
    pub amount: i64,
}

impl NewOrder {
    pub fn new(username: impl Into<String>, amount: i64) -> Self {
        Self {
            username: username.into(),
            amount,
        }
    }
}
