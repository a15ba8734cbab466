use super::{decimal_string, parse_decimal};
use crate::domain::repositories::{ExecutionRow, TradeRepository};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

pub struct SqliteTradeRepository {
    pool: SqlitePool,
}

impl SqliteTradeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_from(row: &sqlx::sqlite::SqliteRow) -> Result<ExecutionRow> {
        let side: String = row.try_get("side")?;
        let order_type: String = row.try_get("order_type")?;
        let status: String = row.try_get("status")?;
        let metadata: Option<String> = row.try_get("metadata")?;
        let ts: i64 = row.try_get("execution_time")?;

        Ok(ExecutionRow {
            exchange: row.try_get("exchange")?,
            symbol: row.try_get("symbol")?,
            side: side.parse()?,
            order_type: serde_json::from_value(serde_json::Value::String(order_type))?,
            quantity: parse_decimal(row.try_get("quantity")?),
            price: parse_decimal(row.try_get("price")?),
            fee: parse_decimal(row.try_get("fee")?),
            fee_currency: row
                .try_get::<Option<String>, _>("fee_currency")?
                .unwrap_or_default(),
            status: serde_json::from_value(serde_json::Value::String(status))?,
            order_id: row.try_get("order_id")?,
            execution_time: Utc
                .timestamp_millis_opt(ts)
                .single()
                .unwrap_or_else(Utc::now),
            metadata: metadata
                .and_then(|m| serde_json::Value::from_str(&m).ok())
                .unwrap_or(serde_json::Value::Null),
        })
    }
}

#[async_trait]
impl TradeRepository for SqliteTradeRepository {
    async fn record_execution(&self, row: &ExecutionRow) -> Result<()> {
        // ON CONFLICT DO NOTHING: (exchange, order_id) is unique, so
        // redelivered execution reports collapse here.
        sqlx::query(
            r#"
            INSERT INTO trades (
                exchange, symbol, side, order_type, quantity, price,
                fee, fee_currency, status, order_id, execution_time, metadata
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(exchange, order_id) DO NOTHING
            "#,
        )
        .bind(&row.exchange)
        .bind(&row.symbol)
        .bind(row.side.to_string())
        .bind(row.order_type.to_string())
        .bind(decimal_string(row.quantity))
        .bind(decimal_string(row.price))
        .bind(decimal_string(row.fee))
        .bind(&row.fee_currency)
        .bind(row.status.to_string())
        .bind(&row.order_id)
        .bind(row.execution_time.timestamp_millis())
        .bind(row.metadata.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to record execution")?;
        Ok(())
    }

    async fn find_by_order(&self, exchange: &str, order_id: &str) -> Result<Option<ExecutionRow>> {
        let row = sqlx::query("SELECT * FROM trades WHERE exchange = ? AND order_id = ?")
            .bind(exchange)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| Self::row_from(&r)).transpose()
    }

    async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM trades")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("count")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{OrderStatus, OrderType, Side};
    use crate::infrastructure::persistence::Database;

    fn sample_row(order_id: &str) -> ExecutionRow {
        ExecutionRow {
            exchange: "binance".to_string(),
            symbol: "BTC/USDT".to_string(),
            side: Side::Buy,
            order_type: OrderType::Market,
            quantity: 0.02,
            price: 50100.0,
            fee: 1.002,
            fee_currency: "USDT".to_string(),
            status: OrderStatus::Filled,
            order_id: order_id.to_string(),
            execution_time: Utc::now(),
            metadata: serde_json::json!({"quality_score": 92.5}),
        }
    }

    #[tokio::test]
    async fn test_record_and_find() {
        let db = Database::in_memory().await.unwrap();
        let repo = SqliteTradeRepository::new(db.pool.clone());

        repo.record_execution(&sample_row("order-1")).await.unwrap();
        let found = repo.find_by_order("binance", "order-1").await.unwrap();
        let found = found.expect("row expected");
        assert_eq!(found.symbol, "BTC/USDT");
        assert_eq!(found.quantity, 0.02);
        assert_eq!(found.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_duplicate_order_id_collapses() {
        let db = Database::in_memory().await.unwrap();
        let repo = SqliteTradeRepository::new(db.pool.clone());

        repo.record_execution(&sample_row("order-1")).await.unwrap();
        repo.record_execution(&sample_row("order-1")).await.unwrap();
        assert_eq!(repo.count().await.unwrap(), 1);

        repo.record_execution(&sample_row("order-2")).await.unwrap();
        assert_eq!(repo.count().await.unwrap(), 2);
    }
}
