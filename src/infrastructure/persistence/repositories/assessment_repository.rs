use crate::domain::repositories::{AssessmentRepository, AssessmentRow};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

pub struct SqliteAssessmentRepository {
    pool: SqlitePool,
}

impl SqliteAssessmentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AssessmentRepository for SqliteAssessmentRepository {
    async fn save(&self, row: &AssessmentRow) -> Result<()> {
        // Intent ids are unique; a redelivered intent's assessment is
        // a no-op here and the caller short-circuits on `exists`.
        sqlx::query(
            r#"
            INSERT INTO risk_assessments (
                signal_id, intent_id, symbol, risk_score, position_size,
                var_estimate, max_loss, approved, rejection_reason, metadata
            )
            VALUES (NULL, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(intent_id) DO NOTHING
            "#,
        )
        .bind(&row.intent_id)
        .bind(&row.symbol)
        .bind(row.risk_score)
        .bind(row.position_size)
        .bind(row.var_estimate)
        .bind(row.max_loss)
        .bind(row.approved)
        .bind(&row.rejection_reason)
        .bind(row.metadata.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to save risk assessment")?;
        Ok(())
    }

    async fn exists(&self, intent_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM risk_assessments WHERE intent_id = ?")
            .bind(intent_id)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count > 0)
    }
}
