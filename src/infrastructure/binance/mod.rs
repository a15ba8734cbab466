//! Binance exchange gateway adapter: REST order and market-data
//! access with HMAC-SHA256 request signing, plus WebSocket streams
//! for order updates, tickers, and candles.
//!
//! The retry policy lives here, at the adapter boundary: reads go
//! through a middleware client with exponential backoff (3 retries);
//! order placement retries at most twice and only when the request
//! provably never reached the exchange.

mod common;
mod execution;
mod market_data;
mod websocket;

pub use common::{from_api_symbol, to_api_symbol};

use crate::config::BinanceConfig;
use crate::domain::errors::GatewayError;
use crate::domain::ports::{
    Balance, Candle, ExchangeGateway, FillRecord, GatewayOrder, GatewayOrderRequest,
    GatewayPosition, OrderBookTop, Ticker,
};
use async_trait::async_trait;
use common::HttpClients;
use tokio::sync::mpsc::Receiver;

pub struct BinanceGateway {
    clients: HttpClients,
    api_key: String,
    api_secret: String,
    base_url: String,
    ws_url: String,
}

impl BinanceGateway {
    pub fn new(config: &BinanceConfig) -> Self {
        Self {
            clients: HttpClients::create(),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            base_url: config.base_url.clone(),
            ws_url: config.ws_url.clone(),
        }
    }
}

#[async_trait]
impl ExchangeGateway for BinanceGateway {
    fn exchange_id(&self) -> &str {
        "binance"
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, GatewayError> {
        self.get_ticker(symbol).await
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, GatewayError> {
        self.get_klines(symbol, timeframe, limit).await
    }

    async fn fetch_order_book(
        &self,
        symbol: &str,
        limit: u32,
    ) -> Result<OrderBookTop, GatewayError> {
        self.get_order_book(symbol, limit).await
    }

    async fn create_order(
        &self,
        request: &GatewayOrderRequest,
    ) -> Result<GatewayOrder, GatewayError> {
        self.place_order(request).await
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), GatewayError> {
        self.cancel_exchange_order(order_id, symbol).await
    }

    async fn fetch_order(
        &self,
        order_id: &str,
        symbol: &str,
    ) -> Result<GatewayOrder, GatewayError> {
        self.get_order(order_id, symbol).await
    }

    async fn fetch_order_trades(
        &self,
        order_id: &str,
        symbol: &str,
    ) -> Result<Vec<FillRecord>, GatewayError> {
        self.get_order_trades(order_id, symbol).await
    }

    async fn fetch_balance(&self) -> Result<Balance, GatewayError> {
        self.get_balance().await
    }

    async fn fetch_positions(&self) -> Result<Vec<GatewayPosition>, GatewayError> {
        self.get_positions().await
    }

    async fn watch_orders(&self, symbol: &str) -> Result<Receiver<GatewayOrder>, GatewayError> {
        self.stream_orders(symbol).await
    }

    async fn watch_ticker(&self, symbol: &str) -> Result<Receiver<Ticker>, GatewayError> {
        self.stream_ticker(symbol).await
    }

    async fn watch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
    ) -> Result<Receiver<Candle>, GatewayError> {
        self.stream_ohlcv(symbol, timeframe).await
    }
}
