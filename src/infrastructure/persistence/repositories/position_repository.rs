use super::{decimal_string, optional_decimal_string, parse_decimal};
use crate::domain::repositories::{PositionRepository, PositionRow};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sqlx::{Row, SqlitePool};

pub struct SqlitePositionRepository {
    pool: SqlitePool,
}

impl SqlitePositionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_from(row: &sqlx::sqlite::SqliteRow) -> Result<PositionRow> {
        let side: String = row.try_get("side")?;
        let status: String = row.try_get("status")?;
        let stop_loss: Option<String> = row.try_get("stop_loss")?;
        let take_profit: Option<String> = row.try_get("take_profit")?;
        let metadata: Option<String> = row.try_get("metadata")?;
        let opened: i64 = row.try_get("opened_at")?;
        let closed: Option<i64> = row.try_get("closed_at")?;

        Ok(PositionRow {
            position_id: row.try_get("id")?,
            exchange: row.try_get("exchange")?,
            symbol: row.try_get("symbol")?,
            side: serde_json::from_value(serde_json::Value::String(side))?,
            quantity: parse_decimal(row.try_get("quantity")?),
            entry_price: parse_decimal(row.try_get("entry_price")?),
            current_price: parse_decimal(row.try_get("current_price")?),
            unrealized_pnl: parse_decimal(row.try_get("unrealized_pnl")?),
            realized_pnl: parse_decimal(row.try_get("realized_pnl")?),
            stop_loss: stop_loss.as_deref().map(parse_decimal),
            take_profit: take_profit.as_deref().map(parse_decimal),
            leverage: row.try_get("leverage")?,
            margin: row.try_get("margin")?,
            status: serde_json::from_value(serde_json::Value::String(status))?,
            opened_at: Utc
                .timestamp_millis_opt(opened)
                .single()
                .unwrap_or_else(Utc::now),
            closed_at: closed.and_then(|ts| Utc.timestamp_millis_opt(ts).single()),
            metadata: metadata
                .and_then(|m| serde_json::from_str(&m).ok())
                .unwrap_or(serde_json::Value::Null),
        })
    }
}

#[async_trait]
impl PositionRepository for SqlitePositionRepository {
    async fn upsert(&self, row: &PositionRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO positions (
                id, exchange, symbol, side, quantity, entry_price,
                current_price, unrealized_pnl, realized_pnl, stop_loss,
                take_profit, leverage, margin, status, opened_at,
                closed_at, metadata
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                quantity = excluded.quantity,
                entry_price = excluded.entry_price,
                current_price = excluded.current_price,
                unrealized_pnl = excluded.unrealized_pnl,
                realized_pnl = excluded.realized_pnl,
                stop_loss = excluded.stop_loss,
                take_profit = excluded.take_profit,
                status = excluded.status,
                closed_at = excluded.closed_at,
                metadata = excluded.metadata
            "#,
        )
        .bind(&row.position_id)
        .bind(&row.exchange)
        .bind(&row.symbol)
        .bind(row.side.to_string())
        .bind(decimal_string(row.quantity))
        .bind(decimal_string(row.entry_price))
        .bind(decimal_string(row.current_price))
        .bind(decimal_string(row.unrealized_pnl))
        .bind(decimal_string(row.realized_pnl))
        .bind(optional_decimal_string(row.stop_loss))
        .bind(optional_decimal_string(row.take_profit))
        .bind(row.leverage)
        .bind(row.margin)
        .bind(row.status.to_string())
        .bind(row.opened_at.timestamp_millis())
        .bind(row.closed_at.map(|ts| ts.timestamp_millis()))
        .bind(row.metadata.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to upsert position")?;
        Ok(())
    }

    async fn find_open(&self) -> Result<Vec<PositionRow>> {
        let rows = sqlx::query("SELECT * FROM positions WHERE status != 'CLOSED'")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_from).collect()
    }

    async fn find(&self, position_id: &str) -> Result<Option<PositionRow>> {
        let row = sqlx::query("SELECT * FROM positions WHERE id = ?")
            .bind(position_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::row_from(&r)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{PositionSide, PositionStatus};
    use crate::infrastructure::persistence::Database;

    fn sample_row(id: &str, status: PositionStatus) -> PositionRow {
        PositionRow {
            position_id: id.to_string(),
            exchange: "binance".to_string(),
            symbol: "BTC/USDT".to_string(),
            side: PositionSide::Long,
            quantity: 0.1,
            entry_price: 50000.0,
            current_price: 50500.0,
            unrealized_pnl: 50.0,
            realized_pnl: 0.0,
            stop_loss: Some(48000.0),
            take_profit: Some(54000.0),
            leverage: 1.0,
            margin: 0.0,
            status,
            opened_at: Utc::now(),
            closed_at: None,
            metadata: serde_json::json!({"order_id": "mock-1"}),
        }
    }

    #[tokio::test]
    async fn test_upsert_and_find_open() {
        let db = Database::in_memory().await.unwrap();
        let repo = SqlitePositionRepository::new(db.pool.clone());

        repo.upsert(&sample_row("p1", PositionStatus::Open)).await.unwrap();
        repo.upsert(&sample_row("p2", PositionStatus::PartiallyClosed))
            .await
            .unwrap();
        repo.upsert(&sample_row("p3", PositionStatus::Closed)).await.unwrap();

        let open = repo.find_open().await.unwrap();
        assert_eq!(open.len(), 2);

        let found = repo.find("p1").await.unwrap().expect("row expected");
        assert_eq!(found.side, PositionSide::Long);
        assert_eq!(found.stop_loss, Some(48000.0));
    }

    #[tokio::test]
    async fn test_upsert_mirrors_state_changes() {
        let db = Database::in_memory().await.unwrap();
        let repo = SqlitePositionRepository::new(db.pool.clone());

        repo.upsert(&sample_row("p1", PositionStatus::Open)).await.unwrap();

        let mut updated = sample_row("p1", PositionStatus::Closed);
        updated.quantity = 0.0;
        updated.realized_pnl = 120.0;
        updated.closed_at = Some(Utc::now());
        repo.upsert(&updated).await.unwrap();

        let found = repo.find("p1").await.unwrap().expect("row expected");
        assert_eq!(found.status, PositionStatus::Closed);
        assert_eq!(found.quantity, 0.0);
        assert_eq!(found.realized_pnl, 120.0);
        assert!(found.closed_at.is_some());
        assert!(repo.find_open().await.unwrap().is_empty());
    }
}
