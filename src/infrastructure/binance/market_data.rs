//! Read-side REST endpoints: ticker, klines, order book depth. All
//! calls go through the retrying client.

use super::BinanceGateway;
use super::common::{build_url, parse_f64, to_api_symbol};
use crate::domain::errors::GatewayError;
use crate::domain::ports::{Candle, OrderBookTop, Ticker};
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use tracing::debug;

#[derive(Deserialize)]
struct TickerResponse {
    #[serde(rename = "lastPrice")]
    last_price: String,
    #[serde(rename = "bidPrice")]
    bid_price: String,
    #[serde(rename = "askPrice")]
    ask_price: String,
    #[serde(rename = "closeTime")]
    close_time: i64,
}

#[derive(Deserialize)]
struct DepthResponse {
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

impl BinanceGateway {
    pub(super) async fn get_ticker(&self, symbol: &str) -> Result<Ticker, GatewayError> {
        let url = build_url(
            &self.base_url,
            "/api/v3/ticker/24hr",
            Some(&format!("symbol={}", to_api_symbol(symbol))),
        )?;
        let response = self
            .clients
            .read
            .get(url)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        if response.status() == reqwest::StatusCode::BAD_REQUEST {
            return Err(GatewayError::UnknownSymbol(symbol.to_string()));
        }
        if !response.status().is_success() {
            return Err(GatewayError::Transient(format!(
                "ticker request failed with {}",
                response.status()
            )));
        }

        let ticker: TickerResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        debug!(symbol = %symbol, last = %ticker.last_price, "Ticker fetched");

        Ok(Ticker {
            last: parse_f64(&ticker.last_price),
            bid: parse_f64(&ticker.bid_price),
            ask: parse_f64(&ticker.ask_price),
            timestamp: Utc
                .timestamp_millis_opt(ticker.close_time)
                .single()
                .unwrap_or_else(Utc::now),
        })
    }

    pub(super) async fn get_klines(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, GatewayError> {
        let url = build_url(
            &self.base_url,
            "/api/v3/klines",
            Some(&format!(
                "symbol={}&interval={}&limit={}",
                to_api_symbol(symbol),
                timeframe,
                limit
            )),
        )?;
        let response = self
            .clients
            .read
            .get(url)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        if !response.status().is_success() {
            return Err(GatewayError::Transient(format!(
                "klines request failed with {}",
                response.status()
            )));
        }

        // Klines come back as arrays:
        // [open_time, open, high, low, close, volume, ...]
        let rows: Vec<Vec<serde_json::Value>> = response
            .json()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        let candles = rows
            .iter()
            .filter_map(|row| {
                let ts = row.first()?.as_i64()?;
                Some(Candle {
                    timestamp: Utc.timestamp_millis_opt(ts).single()?,
                    open: parse_f64(row.get(1)?.as_str()?),
                    high: parse_f64(row.get(2)?.as_str()?),
                    low: parse_f64(row.get(3)?.as_str()?),
                    close: parse_f64(row.get(4)?.as_str()?),
                    volume: parse_f64(row.get(5)?.as_str()?),
                })
            })
            .collect();

        Ok(candles)
    }

    pub(super) async fn get_order_book(
        &self,
        symbol: &str,
        limit: u32,
    ) -> Result<OrderBookTop, GatewayError> {
        let url = build_url(
            &self.base_url,
            "/api/v3/depth",
            Some(&format!(
                "symbol={}&limit={}",
                to_api_symbol(symbol),
                limit.clamp(5, 5000)
            )),
        )?;
        let response = self
            .clients
            .read
            .get(url)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        if !response.status().is_success() {
            return Err(GatewayError::Transient(format!(
                "depth request failed with {}",
                response.status()
            )));
        }

        let depth: DepthResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        let best_bid = depth
            .bids
            .first()
            .ok_or_else(|| GatewayError::Transient("empty bid side".to_string()))?;
        let best_ask = depth
            .asks
            .first()
            .ok_or_else(|| GatewayError::Transient("empty ask side".to_string()))?;

        let bid_price = parse_f64(&best_bid[0]);
        let ask_price = parse_f64(&best_ask[0]);

        Ok(OrderBookTop {
            bid_price,
            bid_volume: parse_f64(&best_bid[1]),
            ask_price,
            ask_volume: parse_f64(&best_ask[1]),
            spread: ask_price - bid_price,
        })
    }
}
