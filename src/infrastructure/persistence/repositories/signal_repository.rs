use crate::domain::repositories::{SignalRepository, SignalRow};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;

pub struct SqliteSignalRepository {
    pool: SqlitePool,
}

impl SqliteSignalRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SignalRepository for SqliteSignalRepository {
    async fn save(&self, row: &SignalRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO signals (
                agent_type, agent_name, symbol, signal_type, confidence,
                price_target, stop_loss, take_profit, reasoning,
                indicators, metadata
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.agent_type)
        .bind(&row.agent_name)
        .bind(&row.symbol)
        .bind(&row.signal_type)
        .bind(row.confidence)
        .bind(row.price_target)
        .bind(row.stop_loss)
        .bind(row.take_profit)
        .bind(&row.reasoning)
        .bind(row.indicators.to_string())
        .bind(row.metadata.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to save signal")?;
        Ok(())
    }
}
