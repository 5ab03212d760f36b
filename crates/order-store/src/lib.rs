pub mod error;
pub mod memory;
pub mod order;
pub mod postgres;
pub mod store;

pub use common::{OrderId, OrderStatus};
pub use error::{Result, StoreError};
pub use memory::InMemoryOrderStore;
pub use order::{NewOrder, Order};
pub use postgres::PostgresOrderStore;
pub use store::{OrderStore, OrderStoreExt, OrderTransaction, StatusGuard, StatusUpdate};
