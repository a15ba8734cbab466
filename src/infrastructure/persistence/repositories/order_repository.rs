use super::{decimal_string, optional_decimal_string, parse_decimal};
use crate::domain::repositories::{OrderRepository, OrderRow};
use crate::domain::types::OrderStatus;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sqlx::{Row, SqlitePool};

pub struct SqliteOrderRepository {
    pool: SqlitePool,
}

impl SqliteOrderRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderRepository for SqliteOrderRepository {
    async fn save(&self, row: &OrderRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                order_id, symbol, side, order_type, quantity, price,
                status, created_at, exchange_order_id, metadata
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(order_id) DO UPDATE SET
                status = excluded.status,
                exchange_order_id = excluded.exchange_order_id,
                metadata = excluded.metadata
            "#,
        )
        .bind(&row.order_id)
        .bind(&row.symbol)
        .bind(row.side.to_string())
        .bind(row.order_type.to_string())
        .bind(decimal_string(row.quantity))
        .bind(optional_decimal_string(row.price))
        .bind(row.status.to_string())
        .bind(row.created_at.timestamp_millis())
        .bind(&row.exchange_order_id)
        .bind(row.metadata.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to save order")?;
        Ok(())
    }

    async fn update_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        exchange_order_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE orders
            SET status = ?, exchange_order_id = COALESCE(?, exchange_order_id)
            WHERE order_id = ?
            "#,
        )
        .bind(status.to_string())
        .bind(exchange_order_id)
        .bind(order_id)
        .execute(&self.pool)
        .await
        .context("Failed to update order status")?;
        Ok(())
    }

    async fn find(&self, order_id: &str) -> Result<Option<OrderRow>> {
        let row = sqlx::query("SELECT * FROM orders WHERE order_id = ?")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let side: String = row.try_get("side")?;
        let order_type: String = row.try_get("order_type")?;
        let status: String = row.try_get("status")?;
        let price: Option<String> = row.try_get("price")?;
        let metadata: Option<String> = row.try_get("metadata")?;
        let created: i64 = row.try_get("created_at")?;

        Ok(Some(OrderRow {
            order_id: row.try_get("order_id")?,
            symbol: row.try_get("symbol")?,
            side: side.parse()?,
            order_type: serde_json::from_value(serde_json::Value::String(order_type))?,
            quantity: parse_decimal(row.try_get("quantity")?),
            price: price.as_deref().map(parse_decimal),
            status: serde_json::from_value(serde_json::Value::String(status))?,
            created_at: Utc
                .timestamp_millis_opt(created)
                .single()
                .unwrap_or_else(Utc::now),
            exchange_order_id: row.try_get("exchange_order_id")?,
            metadata: metadata
                .and_then(|m| serde_json::from_str(&m).ok())
                .unwrap_or(serde_json::Value::Null),
        }))
    }
}
