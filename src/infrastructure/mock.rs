//! Mock implementations of the ports, used by tests and by
//! `EXCHANGE_MODE=mock` runs: a scriptable exchange gateway, an
//! in-memory time-series store, and in-memory repositories.

use crate::domain::errors::GatewayError;
use crate::domain::ports::{
    Balance, Candle, ExchangeGateway, FillRecord, GatewayOrder, GatewayOrderRequest,
    GatewayPosition, MarketStore, OhlcvPoint, OrderBookTop, Ticker,
};
use crate::domain::repositories::{
    AssessmentRepository, AssessmentRow, DecisionRepository, DecisionRow, ExecutionRow,
    OrderRepository, OrderRow, PositionRepository, PositionRow, SignalRepository, SignalRow,
    TradeRepository, WorkerConfigRepository,
};
use crate::domain::types::{OrderStatus, OrderType, PositionStatus};
use crate::infrastructure::market_store::sample_stddev;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, Receiver, Sender};

/// How the mock exchange answers `create_order` for market and limit
/// orders.
#[derive(Debug, Clone)]
pub enum FillBehavior {
    /// Fill the full quantity immediately at the given price.
    FillAt(f64),
    /// Come back REJECTED with this error text.
    Reject(String),
    /// Come back OPEN; the test drives updates by hand.
    StayOpen,
    /// Placement itself fails with a transient error.
    FailTransient,
}

struct MockGatewayState {
    fill_behavior: FillBehavior,
    balances: HashMap<String, f64>,
    tickers: HashMap<String, f64>,
    orders: Vec<GatewayOrder>,
    conditionals: Vec<GatewayOrderRequest>,
    fills: HashMap<String, Vec<FillRecord>>,
    watchers: HashMap<String, Vec<Sender<GatewayOrder>>>,
    fail_balance: bool,
    fail_ticker: bool,
}

/// Scriptable exchange gateway.
pub struct MockExchangeGateway {
    exchange_id: String,
    seq: AtomicU64,
    state: Arc<Mutex<MockGatewayState>>,
}

impl MockExchangeGateway {
    pub fn new(exchange_id: impl Into<String>) -> Self {
        Self {
            exchange_id: exchange_id.into(),
            seq: AtomicU64::new(1),
            state: Arc::new(Mutex::new(MockGatewayState {
                fill_behavior: FillBehavior::FillAt(50000.0),
                balances: HashMap::new(),
                tickers: HashMap::new(),
                orders: Vec::new(),
                conditionals: Vec::new(),
                fills: HashMap::new(),
                watchers: HashMap::new(),
                fail_balance: false,
                fail_ticker: false,
            })),
        }
    }

    pub async fn set_fill_behavior(&self, behavior: FillBehavior) {
        self.state.lock().await.fill_behavior = behavior;
    }

    pub async fn set_balance(&self, asset: &str, amount: f64) {
        self.state
            .lock()
            .await
            .balances
            .insert(asset.to_string(), amount);
    }

    pub async fn set_ticker(&self, symbol: &str, price: f64) {
        self.state
            .lock()
            .await
            .tickers
            .insert(symbol.to_string(), price);
    }

    pub async fn fail_balance_fetch(&self, fail: bool) {
        self.state.lock().await.fail_balance = fail;
    }

    pub async fn fail_ticker_fetch(&self, fail: bool) {
        self.state.lock().await.fail_ticker = fail;
    }

    /// STOP_LOSS / TAKE_PROFIT requests placed so far.
    pub async fn placed_conditionals(&self) -> Vec<GatewayOrderRequest> {
        self.state.lock().await.conditionals.clone()
    }

    /// Number of market/limit orders placed.
    pub async fn created_order_count(&self) -> usize {
        self.state.lock().await.orders.len()
    }

    pub async fn last_order_id(&self) -> Option<String> {
        self.state
            .lock()
            .await
            .orders
            .last()
            .map(|o| o.order_id.clone())
    }

    /// Build a FILLED snapshot for an order previously placed, and
    /// push it to any watchers.
    pub async fn filled_update(&self, order_id: &str, quantity: f64, price: f64) -> GatewayOrder {
        let mut state = self.state.lock().await;
        let base = state
            .orders
            .iter()
            .find(|o| o.order_id == order_id)
            .cloned()
            .expect("unknown order id");
        let update = GatewayOrder {
            status: OrderStatus::Filled,
            filled_quantity: quantity,
            remaining_quantity: 0.0,
            average_price: Some(price),
            total_cost: quantity * price,
            timestamp: Utc::now(),
            ..base
        };
        if let Some(watchers) = state.watchers.get_mut(&update.symbol) {
            for watcher in watchers.iter() {
                let _ = watcher.try_send(update.clone());
            }
        }
        update
    }

    fn next_order_id(&self) -> String {
        format!("mock-{}", self.seq.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl ExchangeGateway for MockExchangeGateway {
    fn exchange_id(&self) -> &str {
        &self.exchange_id
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, GatewayError> {
        let state = self.state.lock().await;
        if state.fail_ticker {
            return Err(GatewayError::Transient("ticker fetch failed".to_string()));
        }
        let last = state
            .tickers
            .get(symbol)
            .copied()
            .ok_or_else(|| GatewayError::UnknownSymbol(symbol.to_string()))?;
        Ok(Ticker {
            last,
            bid: last * 0.9995,
            ask: last * 1.0005,
            timestamp: Utc::now(),
        })
    }

    async fn fetch_ohlcv(
        &self,
        _symbol: &str,
        _timeframe: &str,
        _limit: u32,
    ) -> Result<Vec<Candle>, GatewayError> {
        Ok(Vec::new())
    }

    async fn fetch_order_book(
        &self,
        symbol: &str,
        _limit: u32,
    ) -> Result<OrderBookTop, GatewayError> {
        let ticker = self.fetch_ticker(symbol).await?;
        Ok(OrderBookTop {
            bid_price: ticker.bid,
            bid_volume: 1.0,
            ask_price: ticker.ask,
            ask_volume: 1.0,
            spread: ticker.ask - ticker.bid,
        })
    }

    async fn create_order(
        &self,
        request: &GatewayOrderRequest,
    ) -> Result<GatewayOrder, GatewayError> {
        let mut state = self.state.lock().await;

        // Conditional orders always place as OPEN.
        if matches!(
            request.order_type,
            OrderType::StopLoss | OrderType::TakeProfit
        ) {
            state.conditionals.push(request.clone());
            return Ok(GatewayOrder {
                order_id: self.next_order_id(),
                symbol: request.symbol.clone(),
                side: request.side,
                order_type: request.order_type,
                status: OrderStatus::Open,
                quantity: request.quantity,
                filled_quantity: 0.0,
                remaining_quantity: request.quantity,
                average_price: None,
                total_cost: 0.0,
                fee: 0.0,
                fee_currency: "USDT".to_string(),
                timestamp: Utc::now(),
                error: None,
            });
        }

        let behavior = state.fill_behavior.clone();
        let order = match behavior {
            FillBehavior::FillAt(price) => {
                let order_id = self.next_order_id();
                state.fills.insert(
                    order_id.clone(),
                    vec![FillRecord {
                        fill_id: format!("{}-f1", order_id),
                        order_id: order_id.clone(),
                        symbol: request.symbol.clone(),
                        side: request.side,
                        quantity: request.quantity,
                        price,
                        cost: request.quantity * price,
                        fee: request.quantity * price * 0.001,
                        fee_currency: "USDT".to_string(),
                        timestamp: Utc::now(),
                        is_maker: false,
                    }],
                );
                GatewayOrder {
                    order_id,
                    symbol: request.symbol.clone(),
                    side: request.side,
                    order_type: request.order_type,
                    status: OrderStatus::Filled,
                    quantity: request.quantity,
                    filled_quantity: request.quantity,
                    remaining_quantity: 0.0,
                    average_price: Some(price),
                    total_cost: request.quantity * price,
                    fee: request.quantity * price * 0.001,
                    fee_currency: "USDT".to_string(),
                    timestamp: Utc::now(),
                    error: None,
                }
            }
            FillBehavior::Reject(reason) => GatewayOrder {
                order_id: format!("rejected-{}", self.seq.fetch_add(1, Ordering::Relaxed)),
                symbol: request.symbol.clone(),
                side: request.side,
                order_type: request.order_type,
                status: OrderStatus::Rejected,
                quantity: request.quantity,
                filled_quantity: 0.0,
                remaining_quantity: request.quantity,
                average_price: None,
                total_cost: 0.0,
                fee: 0.0,
                fee_currency: "USDT".to_string(),
                timestamp: Utc::now(),
                error: Some(reason),
            },
            FillBehavior::StayOpen => GatewayOrder {
                order_id: self.next_order_id(),
                symbol: request.symbol.clone(),
                side: request.side,
                order_type: request.order_type,
                status: OrderStatus::Open,
                quantity: request.quantity,
                filled_quantity: 0.0,
                remaining_quantity: request.quantity,
                average_price: None,
                total_cost: 0.0,
                fee: 0.0,
                fee_currency: "USDT".to_string(),
                timestamp: Utc::now(),
                error: None,
            },
            FillBehavior::FailTransient => {
                return Err(GatewayError::Transient("connection refused".to_string()));
            }
        };

        state.orders.push(order.clone());
        Ok(order)
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &str) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        if let Some(order) = state.orders.iter_mut().find(|o| o.order_id == order_id) {
            order.status = OrderStatus::Cancelled;
        }
        Ok(())
    }

    async fn fetch_order(
        &self,
        order_id: &str,
        _symbol: &str,
    ) -> Result<GatewayOrder, GatewayError> {
        let state = self.state.lock().await;
        state
            .orders
            .iter()
            .find(|o| o.order_id == order_id)
            .cloned()
            .ok_or_else(|| GatewayError::Rejected(format!("unknown order: {}", order_id)))
    }

    async fn fetch_order_trades(
        &self,
        order_id: &str,
        _symbol: &str,
    ) -> Result<Vec<FillRecord>, GatewayError> {
        let state = self.state.lock().await;
        Ok(state.fills.get(order_id).cloned().unwrap_or_default())
    }

    async fn fetch_balance(&self) -> Result<Balance, GatewayError> {
        let state = self.state.lock().await;
        if state.fail_balance {
            return Err(GatewayError::Transient("balance fetch failed".to_string()));
        }
        Ok(Balance {
            free: state.balances.clone(),
            total: state.balances.clone(),
        })
    }

    async fn fetch_positions(&self) -> Result<Vec<GatewayPosition>, GatewayError> {
        Ok(Vec::new())
    }

    async fn watch_orders(&self, symbol: &str) -> Result<Receiver<GatewayOrder>, GatewayError> {
        let (tx, rx) = mpsc::channel(16);
        self.state
            .lock()
            .await
            .watchers
            .entry(symbol.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn watch_ticker(&self, _symbol: &str) -> Result<Receiver<Ticker>, GatewayError> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }

    async fn watch_ohlcv(
        &self,
        _symbol: &str,
        _timeframe: &str,
    ) -> Result<Receiver<Candle>, GatewayError> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }
}

/// In-memory time-series store.
#[derive(Default)]
pub struct MockMarketStore {
    ohlcv: Mutex<Vec<OhlcvPoint>>,
    indicators: Mutex<HashMap<(String, String), (DateTime<Utc>, f64)>>,
}

impl MockMarketStore {
    pub async fn set_indicator(&self, symbol: &str, name: &str, value: f64) {
        self.indicators
            .lock()
            .await
            .insert((symbol.to_string(), name.to_string()), (Utc::now(), value));
    }

    pub async fn push_close(&self, symbol: &str, close: f64) {
        self.ohlcv.lock().await.push(OhlcvPoint {
            symbol: symbol.to_string(),
            exchange: "mock".to_string(),
            interval: "1m".to_string(),
            timestamp: Utc::now(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
        });
    }
}

#[async_trait]
impl MarketStore for MockMarketStore {
    async fn write_ohlcv(&self, point: &OhlcvPoint) -> Result<()> {
        self.ohlcv.lock().await.push(point.clone());
        Ok(())
    }

    async fn write_indicator(
        &self,
        symbol: &str,
        name: &str,
        timestamp: DateTime<Utc>,
        value: f64,
    ) -> Result<()> {
        self.indicators
            .lock()
            .await
            .insert((symbol.to_string(), name.to_string()), (timestamp, value));
        Ok(())
    }

    async fn last_close(&self, symbol: &str, window: Duration) -> Result<Option<f64>> {
        let cutoff = Utc::now() - window;
        let points = self.ohlcv.lock().await;
        Ok(points
            .iter()
            .filter(|p| p.symbol == symbol && p.timestamp >= cutoff)
            .max_by_key(|p| p.timestamp)
            .map(|p| p.close))
    }

    async fn last_indicator(
        &self,
        symbol: &str,
        name: &str,
        window: Duration,
    ) -> Result<Option<f64>> {
        let cutoff = Utc::now() - window;
        let indicators = self.indicators.lock().await;
        Ok(indicators
            .get(&(symbol.to_string(), name.to_string()))
            .filter(|(ts, _)| *ts >= cutoff)
            .map(|(_, value)| *value))
    }

    async fn close_stddev(&self, symbol: &str, window: Duration) -> Result<Option<f64>> {
        let cutoff = Utc::now() - window;
        let points = self.ohlcv.lock().await;
        let closes: Vec<f64> = points
            .iter()
            .filter(|p| p.symbol == symbol && p.timestamp >= cutoff)
            .map(|p| p.close)
            .collect();
        Ok(sample_stddev(&closes))
    }

    async fn ohlcv_range(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<OhlcvPoint>> {
        let points = self.ohlcv.lock().await;
        Ok(points
            .iter()
            .filter(|p| p.symbol == symbol && p.timestamp >= start && p.timestamp <= end)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MockTradeRepository {
    rows: Mutex<Vec<ExecutionRow>>,
}

impl MockTradeRepository {
    pub async fn count(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn all(&self) -> Vec<ExecutionRow> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl TradeRepository for MockTradeRepository {
    async fn record_execution(&self, row: &ExecutionRow) -> Result<()> {
        let mut rows = self.rows.lock().await;
        // Unique (exchange, order_id): redeliveries collapse.
        if rows
            .iter()
            .any(|r| r.exchange == row.exchange && r.order_id == row.order_id)
        {
            return Ok(());
        }
        rows.push(row.clone());
        Ok(())
    }

    async fn find_by_order(&self, exchange: &str, order_id: &str) -> Result<Option<ExecutionRow>> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .find(|r| r.exchange == exchange && r.order_id == order_id)
            .cloned())
    }

    async fn count(&self) -> Result<i64> {
        Ok(self.rows.lock().await.len() as i64)
    }
}

#[derive(Default)]
pub struct MockOrderRepository {
    rows: Mutex<HashMap<String, OrderRow>>,
}

#[async_trait]
impl OrderRepository for MockOrderRepository {
    async fn save(&self, row: &OrderRow) -> Result<()> {
        self.rows
            .lock()
            .await
            .insert(row.order_id.clone(), row.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        exchange_order_id: Option<&str>,
    ) -> Result<()> {
        let mut rows = self.rows.lock().await;
        if let Some(row) = rows.get_mut(order_id) {
            row.status = status;
            if let Some(id) = exchange_order_id {
                row.exchange_order_id = Some(id.to_string());
            }
        }
        Ok(())
    }

    async fn find(&self, order_id: &str) -> Result<Option<OrderRow>> {
        Ok(self.rows.lock().await.get(order_id).cloned())
    }
}

#[derive(Default)]
pub struct MockPositionRepository {
    rows: Mutex<HashMap<String, PositionRow>>,
}

impl MockPositionRepository {
    /// Seed an open position directly, for portfolio-state tests.
    pub async fn insert_open(
        &self,
        symbol: &str,
        quantity: f64,
        entry_price: f64,
        stop_loss: Option<f64>,
    ) {
        let row = PositionRow {
            position_id: format!("seed-{}", symbol),
            exchange: "mock".to_string(),
            symbol: symbol.to_string(),
            side: crate::domain::types::PositionSide::Long,
            quantity,
            entry_price,
            current_price: entry_price,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            stop_loss,
            take_profit: None,
            leverage: 1.0,
            margin: 0.0,
            status: PositionStatus::Open,
            opened_at: Utc::now(),
            closed_at: None,
            metadata: serde_json::json!({}),
        };
        self.rows.lock().await.insert(row.position_id.clone(), row);
    }

    pub async fn all(&self) -> Vec<PositionRow> {
        self.rows.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl PositionRepository for MockPositionRepository {
    async fn upsert(&self, row: &PositionRow) -> Result<()> {
        self.rows
            .lock()
            .await
            .insert(row.position_id.clone(), row.clone());
        Ok(())
    }

    async fn find_open(&self) -> Result<Vec<PositionRow>> {
        Ok(self
            .rows
            .lock()
            .await
            .values()
            .filter(|r| r.status != PositionStatus::Closed)
            .cloned()
            .collect())
    }

    async fn find(&self, position_id: &str) -> Result<Option<PositionRow>> {
        Ok(self.rows.lock().await.get(position_id).cloned())
    }
}

#[derive(Default)]
pub struct MockSignalRepository {
    rows: Mutex<Vec<SignalRow>>,
}

impl MockSignalRepository {
    pub async fn count(&self) -> usize {
        self.rows.lock().await.len()
    }
}

#[async_trait]
impl SignalRepository for MockSignalRepository {
    async fn save(&self, row: &SignalRow) -> Result<()> {
        self.rows.lock().await.push(row.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MockAssessmentRepository {
    rows: Mutex<Vec<AssessmentRow>>,
}

impl MockAssessmentRepository {
    pub async fn count(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn all(&self) -> Vec<AssessmentRow> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl AssessmentRepository for MockAssessmentRepository {
    async fn save(&self, row: &AssessmentRow) -> Result<()> {
        let mut rows = self.rows.lock().await;
        if rows.iter().any(|r| r.intent_id == row.intent_id) {
            return Ok(());
        }
        rows.push(row.clone());
        Ok(())
    }

    async fn exists(&self, intent_id: &str) -> Result<bool> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .any(|r| r.intent_id == intent_id))
    }
}

#[derive(Default)]
pub struct MockDecisionRepository {
    rows: Mutex<Vec<DecisionRow>>,
}

impl MockDecisionRepository {
    pub async fn count(&self) -> usize {
        self.rows.lock().await.len()
    }
}

#[async_trait]
impl DecisionRepository for MockDecisionRepository {
    async fn save(&self, row: &DecisionRow) -> Result<()> {
        self.rows.lock().await.push(row.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MockWorkerConfigRepository {
    rows: Mutex<HashMap<String, serde_json::Value>>,
}

#[async_trait]
impl WorkerConfigRepository for MockWorkerConfigRepository {
    async fn save_state(
        &self,
        worker_name: &str,
        _worker_type: &str,
        config: &serde_json::Value,
    ) -> Result<()> {
        self.rows
            .lock()
            .await
            .insert(worker_name.to_string(), config.clone());
        Ok(())
    }

    async fn load_state(&self, worker_name: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.rows.lock().await.get(worker_name).cloned())
    }
}
