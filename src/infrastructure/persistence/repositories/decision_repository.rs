use crate::domain::repositories::{DecisionRepository, DecisionRow};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;

pub struct SqliteDecisionRepository {
    pool: SqlitePool,
}

impl SqliteDecisionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DecisionRepository for SqliteDecisionRepository {
    async fn save(&self, row: &DecisionRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO strategy_decisions (
                symbol, signal_type, confidence, fusion_strategy,
                num_signals, reasoning, fusion_details, price_target,
                stop_loss, take_profit, metadata
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.symbol)
        .bind(&row.signal_type)
        .bind(row.confidence)
        .bind(&row.fusion_strategy)
        .bind(row.num_signals)
        .bind(&row.reasoning)
        .bind(row.fusion_details.to_string())
        .bind(row.price_target)
        .bind(row.stop_loss)
        .bind(row.take_profit)
        .bind(row.metadata.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to save strategy decision")?;
        Ok(())
    }
}
