//! WebSocket streams: user-data order updates, tickers, and klines.
//! Each stream runs in its own task, reconnects with capped backoff,
//! and stops when the consumer drops the receiver.

use super::BinanceGateway;
use super::common::{build_url, from_api_symbol, map_status, parse_f64, to_api_symbol};
use crate::domain::errors::GatewayError;
use crate::domain::ports::{Candle, GatewayOrder, Ticker};
use crate::domain::types::{OrderType, Side};
use chrono::{TimeZone, Utc};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const MAX_BACKOFF_SECS: u64 = 60;
/// Listen keys expire after 60 minutes; ping at half that.
const LISTEN_KEY_KEEPALIVE_SECS: u64 = 1800;

#[derive(Deserialize)]
struct ListenKeyResponse {
    #[serde(rename = "listenKey")]
    listen_key: String,
}

#[derive(Deserialize)]
struct ExecutionReportEvent {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "s", default)]
    symbol: String,
    #[serde(rename = "S", default)]
    side: String,
    #[serde(rename = "o", default)]
    order_type: String,
    #[serde(rename = "X", default)]
    order_status: String,
    #[serde(rename = "i", default)]
    order_id: u64,
    #[serde(rename = "q", default)]
    quantity: String,
    #[serde(rename = "z", default)]
    filled_quantity: String,
    #[serde(rename = "Z", default)]
    cumulative_quote: String,
    #[serde(rename = "n", default)]
    fee: String,
    #[serde(rename = "N", default)]
    fee_asset: Option<String>,
    #[serde(rename = "E", default)]
    event_time: i64,
}

#[derive(Deserialize)]
struct TickerEvent {
    #[serde(rename = "c", default)]
    last: String,
    #[serde(rename = "b", default)]
    bid: String,
    #[serde(rename = "a", default)]
    ask: String,
    #[serde(rename = "E", default)]
    event_time: i64,
}

#[derive(Deserialize)]
struct KlineEvent {
    #[serde(rename = "k")]
    kline: KlinePayload,
}

#[derive(Deserialize)]
struct KlinePayload {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "x")]
    is_closed: bool,
}

impl BinanceGateway {
    pub(super) async fn stream_orders(
        &self,
        symbol: &str,
    ) -> Result<Receiver<GatewayOrder>, GatewayError> {
        let listen_key = self.create_listen_key().await?;
        let (tx, rx) = mpsc::channel(64);

        let ws_url = format!("{}/ws/{}", self.ws_url, listen_key);
        let wanted_symbol = symbol.to_string();
        let keepalive = self.keepalive_handle(listen_key);

        tokio::spawn(async move {
            run_stream(ws_url, tx, move |text, tx| {
                let event: ExecutionReportEvent = match serde_json::from_str(text) {
                    Ok(event) => event,
                    Err(_) => return true,
                };
                if event.event_type != "executionReport" {
                    return true;
                }
                let Some(event_symbol) = from_api_symbol(&event.symbol) else {
                    return true;
                };
                if event_symbol != wanted_symbol {
                    return true;
                }

                let filled = parse_f64(&event.filled_quantity);
                let quantity = parse_f64(&event.quantity);
                let total = parse_f64(&event.cumulative_quote);
                let order = GatewayOrder {
                    order_id: event.order_id.to_string(),
                    symbol: event_symbol,
                    side: if event.side == "BUY" { Side::Buy } else { Side::Sell },
                    order_type: match event.order_type.as_str() {
                        "LIMIT" => OrderType::Limit,
                        "STOP_LOSS" | "STOP_LOSS_LIMIT" => OrderType::StopLoss,
                        "TAKE_PROFIT" | "TAKE_PROFIT_LIMIT" => OrderType::TakeProfit,
                        _ => OrderType::Market,
                    },
                    status: map_status(&event.order_status),
                    quantity,
                    filled_quantity: filled,
                    remaining_quantity: (quantity - filled).max(0.0),
                    average_price: if filled > 0.0 { Some(total / filled) } else { None },
                    total_cost: total,
                    fee: parse_f64(&event.fee),
                    fee_currency: event.fee_asset.unwrap_or_else(|| "USDT".to_string()),
                    timestamp: Utc
                        .timestamp_millis_opt(event.event_time)
                        .single()
                        .unwrap_or_else(Utc::now),
                    error: None,
                };
                tx.try_send(order).is_ok()
            })
            .await;
            keepalive.abort();
        });

        Ok(rx)
    }

    pub(super) async fn stream_ticker(&self, symbol: &str) -> Result<Receiver<Ticker>, GatewayError> {
        let stream_name = format!("{}@ticker", to_api_symbol(symbol).to_lowercase());
        let ws_url = format!("{}/ws/{}", self.ws_url, stream_name);
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            run_stream(ws_url, tx, |text, tx| {
                let event: TickerEvent = match serde_json::from_str(text) {
                    Ok(event) => event,
                    Err(_) => return true,
                };
                let ticker = Ticker {
                    last: parse_f64(&event.last),
                    bid: parse_f64(&event.bid),
                    ask: parse_f64(&event.ask),
                    timestamp: Utc
                        .timestamp_millis_opt(event.event_time)
                        .single()
                        .unwrap_or_else(Utc::now),
                };
                tx.try_send(ticker).is_ok()
            })
            .await;
        });

        Ok(rx)
    }

    pub(super) async fn stream_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
    ) -> Result<Receiver<Candle>, GatewayError> {
        let stream_name = format!(
            "{}@kline_{}",
            to_api_symbol(symbol).to_lowercase(),
            timeframe
        );
        let ws_url = format!("{}/ws/{}", self.ws_url, stream_name);
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            run_stream(ws_url, tx, |text, tx| {
                let event: KlineEvent = match serde_json::from_str(text) {
                    Ok(event) => event,
                    Err(_) => return true,
                };
                // Emit completed candles only.
                if !event.kline.is_closed {
                    return true;
                }
                let Some(timestamp) = Utc.timestamp_millis_opt(event.kline.open_time).single()
                else {
                    return true;
                };
                let candle = Candle {
                    timestamp,
                    open: parse_f64(&event.kline.open),
                    high: parse_f64(&event.kline.high),
                    low: parse_f64(&event.kline.low),
                    close: parse_f64(&event.kline.close),
                    volume: parse_f64(&event.kline.volume),
                };
                tx.try_send(candle).is_ok()
            })
            .await;
        });

        Ok(rx)
    }

    async fn create_listen_key(&self) -> Result<String, GatewayError> {
        let url = build_url(&self.base_url, "/api/v3/userDataStream", None)?;
        let response = self
            .clients
            .order
            .post(url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        if !response.status().is_success() {
            return Err(GatewayError::Transient(format!(
                "listen key request failed with {}",
                response.status()
            )));
        }

        let parsed: ListenKeyResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;
        Ok(parsed.listen_key)
    }

    fn keepalive_handle(&self, listen_key: String) -> tokio::task::JoinHandle<()> {
        let url = match build_url(
            &self.base_url,
            "/api/v3/userDataStream",
            Some(&format!("listenKey={}", listen_key)),
        ) {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "Keepalive URL invalid; listen key will expire");
                return tokio::spawn(async {});
            }
        };
        let client = self.clients.order.clone();
        let api_key = self.api_key.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                LISTEN_KEY_KEEPALIVE_SECS,
            ));
            interval.tick().await;
            loop {
                interval.tick().await;
                match client
                    .put(url.clone())
                    .header("X-MBX-APIKEY", &api_key)
                    .send()
                    .await
                {
                    Ok(_) => debug!("Listen key keepalive sent"),
                    Err(e) => warn!(error = %e, "Listen key keepalive failed"),
                }
            }
        })
    }
}

/// Drive one WebSocket connection with reconnects. The handler
/// returns `false` when the consumer is gone and the stream should
/// stop.
async fn run_stream<T, F>(ws_url: String, tx: Sender<T>, mut handle_text: F)
where
    T: Send + 'static,
    F: FnMut(&str, &Sender<T>) -> bool,
{
    let mut backoff = 1;
    loop {
        if tx.is_closed() {
            return;
        }

        match connect_async(&ws_url).await {
            Ok((mut stream, _)) => {
                info!(url = %ws_url, "WebSocket connected");
                backoff = 1;

                while let Some(message) = stream.next().await {
                    match message {
                        Ok(Message::Text(text)) => {
                            if !handle_text(text.as_str(), &tx) && tx.is_closed() {
                                return;
                            }
                        }
                        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                        Ok(Message::Close(_)) => {
                            warn!(url = %ws_url, "WebSocket closed by server");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(url = %ws_url, error = %e, "WebSocket read error");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(url = %ws_url, error = %e, backoff, "WebSocket connect failed");
            }
        }

        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_secs(backoff)).await;
        backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
    }
}
