use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

/// Shared SQLite database wrapper. Owns the pool and the schema.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self> {
        Self::prepare_parent_dir(db_url).await?;

        // WAL keeps position upserts from blocking the read-mostly
        // workers sharing the file.
        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("SQLite connection failed for {}", db_url))?;

        let db = Self { pool };
        db.init().await?;
        info!(db_url, "Relational store ready");

        Ok(db)
    }

    /// A file-backed url on a fresh deployment may point into a
    /// directory that does not exist yet; create it so the connect
    /// does not trip over the missing path.
    async fn prepare_parent_dir(db_url: &str) -> Result<()> {
        let Some(file_path) = db_url.strip_prefix("sqlite://") else {
            return Ok(());
        };
        if let Some(parent) = Path::new(file_path).parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Could not create {}", parent.display()))?;
        }
        Ok(())
    }

    /// In-memory database for tests. Uses a single connection: every
    /// pooled connection to `:memory:` would otherwise see its own
    /// empty database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;
        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agent_configs (
                agent_name TEXT PRIMARY KEY,
                agent_type TEXT NOT NULL,
                config TEXT NOT NULL,
                enabled BOOLEAN DEFAULT 1,
                updated_at INTEGER DEFAULT (strftime('%s', 'now'))
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create agent_configs table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                exchange TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                fee TEXT NOT NULL,
                fee_currency TEXT,
                status TEXT NOT NULL,
                order_id TEXT NOT NULL,
                execution_time INTEGER NOT NULL,
                metadata TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_trades_exchange_order
            ON trades (exchange, order_id);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create trades table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_type TEXT NOT NULL,
                agent_name TEXT NOT NULL,
                symbol TEXT NOT NULL,
                signal_type TEXT NOT NULL,
                confidence REAL NOT NULL,
                price_target REAL,
                stop_loss REAL,
                take_profit REAL,
                reasoning TEXT,
                indicators TEXT,
                metadata TEXT,
                created_at INTEGER DEFAULT (strftime('%s', 'now'))
            );
            CREATE INDEX IF NOT EXISTS idx_signals_symbol_time
            ON signals (symbol, created_at);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create signals table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                exchange TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                current_price TEXT NOT NULL,
                unrealized_pnl TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                stop_loss TEXT,
                take_profit TEXT,
                leverage REAL DEFAULT 1.0,
                margin REAL DEFAULT 0.0,
                status TEXT NOT NULL,
                opened_at INTEGER NOT NULL,
                closed_at INTEGER,
                metadata TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_positions_status
            ON positions (status, symbol);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create positions table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                order_id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                exchange_order_id TEXT,
                metadata TEXT
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create orders table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS risk_assessments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                signal_id INTEGER,
                intent_id TEXT,
                symbol TEXT NOT NULL,
                risk_score REAL NOT NULL,
                position_size REAL NOT NULL,
                var_estimate REAL NOT NULL,
                max_loss REAL NOT NULL,
                approved BOOLEAN NOT NULL,
                rejection_reason TEXT,
                metadata TEXT,
                created_at INTEGER DEFAULT (strftime('%s', 'now'))
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_assessments_intent
            ON risk_assessments (intent_id);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create risk_assessments table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS strategy_decisions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                signal_type TEXT NOT NULL,
                confidence REAL NOT NULL,
                fusion_strategy TEXT NOT NULL,
                num_signals INTEGER NOT NULL,
                reasoning TEXT,
                fusion_details TEXT,
                price_target REAL,
                stop_loss REAL,
                take_profit REAL,
                metadata TEXT,
                created_at INTEGER DEFAULT (strftime('%s', 'now'))
            );
            CREATE INDEX IF NOT EXISTS idx_decisions_symbol_time
            ON strategy_decisions (symbol, created_at);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create strategy_decisions table")?;

        // Time-series measurements, served by SqliteMarketStore.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ohlcv (
                symbol TEXT NOT NULL,
                exchange TEXT NOT NULL,
                interval TEXT NOT NULL,
                ts_ms INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                PRIMARY KEY (symbol, exchange, interval, ts_ms)
            );
            CREATE INDEX IF NOT EXISTS idx_ohlcv_symbol_time
            ON ohlcv (symbol, ts_ms);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create ohlcv table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS indicators (
                symbol TEXT NOT NULL,
                name TEXT NOT NULL,
                ts_ms INTEGER NOT NULL,
                value REAL NOT NULL,
                PRIMARY KEY (symbol, name, ts_ms)
            );
            CREATE TABLE IF NOT EXISTS orderbook (
                symbol TEXT NOT NULL,
                exchange TEXT NOT NULL,
                ts_ms INTEGER NOT NULL,
                bid_price REAL NOT NULL,
                bid_volume REAL NOT NULL,
                ask_price REAL NOT NULL,
                ask_volume REAL NOT NULL,
                spread REAL NOT NULL,
                PRIMARY KEY (symbol, exchange, ts_ms)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create time-series tables")?;

        info!("Schema ensured for all pipeline tables");
        Ok(())
    }
}
