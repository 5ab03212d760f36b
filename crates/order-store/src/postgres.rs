use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};

use crate::store::{OrderStore, OrderTransaction, StatusGuard, StatusUpdate, apply_guard};
use crate::{NewOrder, Order, OrderId, OrderStatus, Result};

const SCHEMA: &str = include_str!("../../../migrations/001_create_orders_table.sql");

/// PostgreSQL-backed order store implementation.
#[derive(Clone)]
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    /// Creates a new PostgreSQL order store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_order(row: PgRow) -> Result<Order> {
        let status: String = row.try_get("status")?;

        Ok(Order {
            id: OrderId::new(row.try_get("id")?),
            username: row.try_get("username")?,
            amount: row.try_get("amount")?,
            status: status.parse()?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

struct PostgresOrderTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl OrderTransaction for PostgresOrderTransaction {
    async fn insert(&mut self, order: NewOrder) -> Result<Order> {
        let row = sqlx::query(
            r#"
            INSERT INTO orders (username, amount, status)
            VALUES ($1, $2, $3)
            RETURNING id, username, amount, status, created_at, updated_at
            "#,
        )
        .bind(&order.username)
        .bind(order.amount)
        .bind(OrderStatus::Processing.as_str())
        .fetch_one(&mut *self.tx)
        .await?;

        PostgresOrderStore::row_to_order(row)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    async fn begin(&self) -> Result<Box<dyn OrderTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresOrderTransaction { tx }))
    }

    #[tracing::instrument(skip(self))]
    async fn update_status(
        &self,
        id: OrderId,
        status: OrderStatus,
        guard: StatusGuard,
    ) -> Result<StatusUpdate> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM orders WHERE id = $1 FOR UPDATE")
                .bind(id.as_i64())
                .fetch_optional(&mut *tx)
                .await?;

        let Some(current) = current else {
            return Ok(StatusUpdate::NotFound);
        };
        let previous: OrderStatus = current.parse()?;
        if let Err(skipped) = apply_guard(previous, guard) {
            return Ok(skipped);
        }

        sqlx::query("UPDATE orders SET status = $1, updated_at = NOW() WHERE id = $2")
            .bind(status.as_str())
            .bind(id.as_i64())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(StatusUpdate::Updated { previous })
    }

    async fn get(&self, id: OrderId) -> Result<Option<Order>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT id, username, amount, status, created_at, updated_at
            FROM orders
            WHERE id = $1
            "#,
        )
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_order).transpose()
    }

    async fn list(&self) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            r#"
            SELECT id, username, amount, status, created_at, updated_at
            FROM orders
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_order).collect()
    }

    #[tracing::instrument(skip(self))]
    async fn reset_schema(&self) -> Result<()> {
        sqlx::query("DROP TABLE IF EXISTS orders")
            .execute(&self.pool)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;

        tracing::info!("order table recreated");
        Ok(())
    }
}
