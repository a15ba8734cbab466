//! Repository traits over the relational store.
//!
//! Business logic depends on these abstractions only; the Sqlite
//! implementations live in `infrastructure::persistence`. Writes are
//! single-statement; idempotency is enforced at the store level:
//! executions are unique by `(exchange, order_id)`, risk assessments
//! by intent id, so redelivered messages collapse on persistence.

use crate::domain::types::{OrderStatus, OrderType, PositionSide, PositionStatus, Side};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Row in the `trades` table: one execution against the exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRow {
    pub exchange: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: f64,
    pub fee: f64,
    pub fee_currency: String,
    pub status: OrderStatus,
    pub order_id: String,
    pub execution_time: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait TradeRepository: Send + Sync {
    /// Record an execution. Inserting the same `(exchange, order_id)`
    /// twice is a no-op, which is what makes report redelivery safe.
    async fn record_execution(&self, row: &ExecutionRow) -> Result<()>;

    async fn find_by_order(&self, exchange: &str, order_id: &str) -> Result<Option<ExecutionRow>>;

    async fn count(&self) -> Result<i64>;
}

/// Row in the `orders` table: intent-side view of an order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRow {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub exchange_order_id: Option<String>,
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn save(&self, row: &OrderRow) -> Result<()>;

    async fn update_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        exchange_order_id: Option<&str>,
    ) -> Result<()>;

    async fn find(&self, order_id: &str) -> Result<Option<OrderRow>>;
}

/// Row in the `positions` table.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionRow {
    pub position_id: String,
    pub exchange: String,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub leverage: f64,
    pub margin: f64,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait PositionRepository: Send + Sync {
    /// Insert or update by position id; mirrors the in-memory ledger
    /// on every state change.
    async fn upsert(&self, row: &PositionRow) -> Result<()>;

    async fn find_open(&self) -> Result<Vec<PositionRow>>;

    async fn find(&self, position_id: &str) -> Result<Option<PositionRow>>;
}

/// Row in the `signals` table.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalRow {
    pub agent_type: String,
    pub agent_name: String,
    pub symbol: String,
    pub signal_type: String,
    pub confidence: f64,
    pub price_target: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub reasoning: Option<String>,
    pub indicators: serde_json::Value,
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait SignalRepository: Send + Sync {
    async fn save(&self, row: &SignalRow) -> Result<()>;
}

/// Row in the `risk_assessments` table.
#[derive(Debug, Clone, PartialEq)]
pub struct AssessmentRow {
    pub intent_id: String,
    pub symbol: String,
    pub risk_score: f64,
    pub position_size: f64,
    pub var_estimate: f64,
    pub max_loss: f64,
    pub approved: bool,
    pub rejection_reason: Option<String>,
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait AssessmentRepository: Send + Sync {
    /// Persist an assessment. Duplicate intent ids are ignored so a
    /// redelivered intent does not produce a second order.
    async fn save(&self, row: &AssessmentRow) -> Result<()>;

    async fn exists(&self, intent_id: &str) -> Result<bool>;
}

/// Row in the `strategy_decisions` table.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionRow {
    pub symbol: String,
    pub signal_type: String,
    pub confidence: f64,
    pub fusion_strategy: String,
    pub num_signals: i64,
    pub reasoning: String,
    pub fusion_details: serde_json::Value,
    pub price_target: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait DecisionRepository: Send + Sync {
    async fn save(&self, row: &DecisionRow) -> Result<()>;
}

/// Persisted per-worker configuration (`agent_configs` table).
#[async_trait]
pub trait WorkerConfigRepository: Send + Sync {
    async fn save_state(
        &self,
        worker_name: &str,
        worker_type: &str,
        config: &serde_json::Value,
    ) -> Result<()>;

    async fn load_state(&self, worker_name: &str) -> Result<Option<serde_json::Value>>;
}
