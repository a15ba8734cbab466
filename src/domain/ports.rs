//! Port traits for the external services the core depends on: the
//! message bus, the exchange gateway, and the time-series store.
//! Relational repositories live in [`crate::domain::repositories`].

use crate::domain::errors::{BusError, GatewayError};
use crate::domain::types::{OrderStatus, OrderType, Side};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::mpsc::Receiver;

/// One message handed to a consumer queue.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub priority: u8,
    pub body: Vec<u8>,
}

/// Topic-based publish/subscribe with durable, prioritized,
/// per-consumer queues.
///
/// Delivery order within one queue follows priority (higher first),
/// then publish order. Consumers receive messages one at a time; the
/// channel capacity bounds prefetch.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, body: Vec<u8>, priority: u8) -> Result<(), BusError>;

    /// Bind `queue` to `topic` and start consuming. A queue survives
    /// its consumer: re-subscribing with the same name drains what
    /// accumulated in the meantime.
    async fn subscribe(&self, queue: &str, topic: &str) -> Result<Receiver<Delivery>, BusError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ticker {
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderBookTop {
    pub bid_price: f64,
    pub bid_volume: f64,
    pub ask_price: f64,
    pub ask_volume: f64,
    pub spread: f64,
}

/// Order placement request as handed to the gateway adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayOrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    /// Limit price; unset for market orders.
    pub price: Option<f64>,
    /// Trigger price for STOP_LOSS / TAKE_PROFIT orders.
    pub trigger_price: Option<f64>,
    /// Client order id, used for idempotent placement.
    pub client_order_id: Option<String>,
}

/// Normalized view of an exchange order.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub quantity: f64,
    pub filled_quantity: f64,
    pub remaining_quantity: f64,
    pub average_price: Option<f64>,
    pub total_cost: f64,
    pub fee: f64,
    pub fee_currency: String,
    pub timestamp: DateTime<Utc>,
    /// Exchange error text for synthetic REJECTED results.
    pub error: Option<String>,
}

/// One trade that (partially) filled an order.
#[derive(Debug, Clone, PartialEq)]
pub struct FillRecord {
    pub fill_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    pub cost: f64,
    pub fee: f64,
    pub fee_currency: String,
    pub timestamp: DateTime<Utc>,
    pub is_maker: bool,
}

/// Account balance, free and total per asset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Balance {
    pub free: HashMap<String, f64>,
    pub total: HashMap<String, f64>,
}

impl Balance {
    pub fn free_of(&self, asset: &str) -> f64 {
        self.free.get(asset).copied().unwrap_or(0.0)
    }
}

/// Unified exchange access. Adapters own the retry policy: reads are
/// retried up to three times with exponential backoff on transient
/// errors, order placement up to twice and never on ambiguous errors.
/// The core makes exactly one call per operation.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    fn exchange_id(&self) -> &str;

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, GatewayError>;

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, GatewayError>;

    async fn fetch_order_book(&self, symbol: &str, limit: u32)
    -> Result<OrderBookTop, GatewayError>;

    /// Place an order. Exchange-side rejections come back as a
    /// synthetic `GatewayOrder` with `status = Rejected` and the
    /// error text set, not as an `Err`.
    async fn create_order(&self, request: &GatewayOrderRequest)
    -> Result<GatewayOrder, GatewayError>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), GatewayError>;

    async fn fetch_order(&self, order_id: &str, symbol: &str)
    -> Result<GatewayOrder, GatewayError>;

    async fn fetch_order_trades(
        &self,
        order_id: &str,
        symbol: &str,
    ) -> Result<Vec<FillRecord>, GatewayError>;

    async fn fetch_balance(&self) -> Result<Balance, GatewayError>;

    async fn fetch_positions(&self) -> Result<Vec<GatewayPosition>, GatewayError>;

    /// Stream of order updates for a symbol. The receiver yields a
    /// normalized snapshot for every state change the exchange pushes.
    async fn watch_orders(&self, symbol: &str) -> Result<Receiver<GatewayOrder>, GatewayError>;

    /// Live ticker stream for a symbol.
    async fn watch_ticker(&self, symbol: &str) -> Result<Receiver<Ticker>, GatewayError>;

    /// Live candle stream for a symbol and timeframe.
    async fn watch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
    ) -> Result<Receiver<Candle>, GatewayError>;
}

/// Normalized exchange-side position (derived from balances on spot
/// venues).
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayPosition {
    pub symbol: String,
    pub quantity: f64,
    pub entry_price: Option<f64>,
}

/// OHLCV point destined for the time-series store.
#[derive(Debug, Clone, PartialEq)]
pub struct OhlcvPoint {
    pub symbol: String,
    pub exchange: String,
    pub interval: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Append-only time-series storage with the window queries the risk
/// core needs. Concurrent readers are safe; the core never updates
/// existing points.
#[async_trait]
pub trait MarketStore: Send + Sync {
    async fn write_ohlcv(&self, point: &OhlcvPoint) -> Result<()>;

    async fn write_indicator(
        &self,
        symbol: &str,
        name: &str,
        timestamp: DateTime<Utc>,
        value: f64,
    ) -> Result<()>;

    /// Most recent close within `window` of now, if any.
    async fn last_close(&self, symbol: &str, window: Duration) -> Result<Option<f64>>;

    /// Most recent value of a named indicator within `window` of now.
    async fn last_indicator(
        &self,
        symbol: &str,
        name: &str,
        window: Duration,
    ) -> Result<Option<f64>>;

    /// Sample standard deviation of closes within `window` of now.
    /// `None` when fewer than two points exist.
    async fn close_stddev(&self, symbol: &str, window: Duration) -> Result<Option<f64>>;

    async fn ohlcv_range(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<OhlcvPoint>>;
}
