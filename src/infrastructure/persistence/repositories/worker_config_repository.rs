use crate::domain::repositories::WorkerConfigRepository;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

pub struct SqliteWorkerConfigRepository {
    pool: SqlitePool,
}

impl SqliteWorkerConfigRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkerConfigRepository for SqliteWorkerConfigRepository {
    async fn save_state(
        &self,
        worker_name: &str,
        worker_type: &str,
        config: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agent_configs (agent_name, agent_type, config, enabled, updated_at)
            VALUES (?, ?, ?, 1, strftime('%s', 'now'))
            ON CONFLICT(agent_name) DO UPDATE SET
                config = excluded.config,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(worker_name)
        .bind(worker_type)
        .bind(config.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to save worker state")?;
        Ok(())
    }

    async fn load_state(&self, worker_name: &str) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query("SELECT config FROM agent_configs WHERE agent_name = ?")
            .bind(worker_name)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let raw: String = row.try_get("config")?;
                Ok(serde_json::from_str(&raw).ok())
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::Database;

    #[tokio::test]
    async fn test_state_round_trip_and_upsert() {
        let db = Database::in_memory().await.unwrap();
        let repo = SqliteWorkerConfigRepository::new(db.pool.clone());

        assert!(repo.load_state("fusion_core").await.unwrap().is_none());

        repo.save_state("fusion_core", "fusion", &serde_json::json!({"min_signals": 2}))
            .await
            .unwrap();
        repo.save_state("fusion_core", "fusion", &serde_json::json!({"min_signals": 3}))
            .await
            .unwrap();

        let state = repo.load_state("fusion_core").await.unwrap().unwrap();
        assert_eq!(state["min_signals"], 3);
    }
}
