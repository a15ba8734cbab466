//! Signed trading endpoints: order placement, cancellation, lookup,
//! fills, and account balance.
//!
//! Placement errors are classified carefully: exchange-side
//! rejections come back as synthetic REJECTED orders, connection
//! errors before the request left retry at most twice, and anything
//! ambiguous surfaces immediately.

use super::BinanceGateway;
use super::common::{
    build_url, classify_send_error, from_api_symbol, map_status, parse_f64, sign, to_api_symbol,
};
use crate::domain::errors::GatewayError;
use crate::domain::ports::{
    Balance, FillRecord, GatewayOrder, GatewayOrderRequest, GatewayPosition,
};
use crate::domain::types::{OrderType, Side};
use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{info, warn};

const PLACEMENT_RETRIES: usize = 2;

#[derive(Deserialize)]
struct OrderResponse {
    #[serde(rename = "orderId")]
    order_id: u64,
    symbol: String,
    status: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    #[serde(rename = "origQty", default)]
    orig_qty: String,
    #[serde(rename = "executedQty", default)]
    executed_qty: String,
    #[serde(rename = "cummulativeQuoteQty", default)]
    cumulative_quote_qty: String,
    #[serde(rename = "transactTime", default)]
    transact_time: Option<i64>,
    #[serde(rename = "time", default)]
    time: Option<i64>,
}

#[derive(Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

#[derive(Deserialize)]
struct TradeResponse {
    id: u64,
    #[serde(rename = "orderId")]
    order_id: u64,
    symbol: String,
    price: String,
    qty: String,
    #[serde(rename = "quoteQty")]
    quote_qty: String,
    commission: String,
    #[serde(rename = "commissionAsset")]
    commission_asset: String,
    time: i64,
    #[serde(rename = "isBuyer")]
    is_buyer: bool,
    #[serde(rename = "isMaker")]
    is_maker: bool,
}

#[derive(Deserialize)]
struct AccountResponse {
    balances: Vec<AssetBalance>,
}

#[derive(Deserialize)]
struct AssetBalance {
    asset: String,
    free: String,
    locked: String,
}

/// Rejection codes the exchange answers domain errors with; see the
/// Binance error code reference.
fn is_domain_rejection(code: i64) -> bool {
    // -1013 invalid quantity, -1121 bad symbol, -2010 new order
    // rejected (insufficient balance, etc.), -2011 cancel rejected.
    matches!(code, -1013 | -1100 | -1111 | -1121 | -2010 | -2011)
}

impl BinanceGateway {
    fn format_quantity(quantity: f64) -> String {
        Decimal::from_f64(quantity)
            .map(|d| d.round_dp(8).normalize())
            .unwrap_or_default()
            .to_string()
    }

    fn signed_query(&self, mut params: Vec<(&str, String)>) -> String {
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));
        let query: String = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let signature = sign(&self.api_secret, &query);
        format!("{}&signature={}", query, signature)
    }

    fn order_from_response(&self, response: OrderResponse, request: &GatewayOrderRequest) -> GatewayOrder {
        let filled = parse_f64(&response.executed_qty);
        let quantity = parse_f64(&response.orig_qty);
        let total_cost = parse_f64(&response.cumulative_quote_qty);
        let average_price = if filled > 0.0 {
            Some(total_cost / filled)
        } else {
            None
        };
        let ts = response.transact_time.or(response.time).unwrap_or_default();

        GatewayOrder {
            order_id: response.order_id.to_string(),
            symbol: from_api_symbol(&response.symbol).unwrap_or_else(|| request.symbol.clone()),
            side: if response.side == "BUY" { Side::Buy } else { Side::Sell },
            order_type: request.order_type,
            status: map_status(&response.status),
            quantity,
            filled_quantity: filled,
            remaining_quantity: (quantity - filled).max(0.0),
            average_price,
            total_cost,
            // Spot order responses carry no fee; fills do.
            fee: 0.0,
            fee_currency: "USDT".to_string(),
            timestamp: Utc.timestamp_millis_opt(ts).single().unwrap_or_else(Utc::now),
            error: None,
        }
    }

    pub(super) async fn place_order(
        &self,
        request: &GatewayOrderRequest,
    ) -> Result<GatewayOrder, GatewayError> {
        let side = request.side.to_string();
        let order_type = match request.order_type {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopLoss => "STOP_LOSS",
            OrderType::TakeProfit => "TAKE_PROFIT",
        };

        let mut params = vec![
            ("symbol", to_api_symbol(&request.symbol)),
            ("side", side),
            ("type", order_type.to_string()),
            ("quantity", Self::format_quantity(request.quantity)),
        ];
        if let Some(price) = request.price
            && request.order_type == OrderType::Limit
        {
            params.push(("price", Self::format_quantity(price)));
            params.push(("timeInForce", "GTC".to_string()));
        }
        if let Some(trigger) = request.trigger_price {
            params.push(("stopPrice", Self::format_quantity(trigger)));
        }
        if let Some(client_id) = &request.client_order_id {
            params.push(("newClientOrderId", client_id.clone()));
        }

        let mut attempt = 0;
        loop {
            // The query is re-signed per attempt so the timestamp
            // stays within the exchange's recv window.
            let signed = self.signed_query(params.clone());
            let url = build_url(&self.base_url, "/api/v3/order", Some(&signed))?;

            let response = match self
                .clients
                .order
                .post(url)
                .header("X-MBX-APIKEY", &self.api_key)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    let classified = classify_send_error(&e);
                    if classified.is_transient() && attempt < PLACEMENT_RETRIES {
                        attempt += 1;
                        warn!(
                            symbol = %request.symbol,
                            attempt,
                            error = %e,
                            "Order placement retry after connect failure"
                        );
                        tokio::time::sleep(std::time::Duration::from_millis(250 * attempt as u64))
                            .await;
                        continue;
                    }
                    return Err(classified);
                }
            };

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| GatewayError::Ambiguous(e.to_string()))?;

            if status.is_success() {
                let parsed: OrderResponse = serde_json::from_str(&body)
                    .map_err(|e| GatewayError::Ambiguous(format!("unparseable order response: {}", e)))?;
                let order = self.order_from_response(parsed, request);
                info!(
                    symbol = %request.symbol,
                    order_id = %order.order_id,
                    status = %order.status,
                    "Binance order placed"
                );
                return Ok(order);
            }

            // Domain rejection: synthesize a REJECTED order so the
            // execution core can reconcile upstream state.
            if let Ok(api_error) = serde_json::from_str::<ApiError>(&body) {
                if is_domain_rejection(api_error.code) {
                    warn!(
                        symbol = %request.symbol,
                        code = api_error.code,
                        msg = %api_error.msg,
                        "Binance rejected order"
                    );
                    return Ok(GatewayOrder {
                        order_id: format!("rejected-{}", Utc::now().timestamp_millis()),
                        symbol: request.symbol.clone(),
                        side: request.side,
                        order_type: request.order_type,
                        status: crate::domain::types::OrderStatus::Rejected,
                        quantity: request.quantity,
                        filled_quantity: 0.0,
                        remaining_quantity: request.quantity,
                        average_price: None,
                        total_cost: 0.0,
                        fee: 0.0,
                        fee_currency: "USDT".to_string(),
                        timestamp: Utc::now(),
                        error: Some(format!("{} ({})", api_error.msg, api_error.code)),
                    });
                }
                return Err(GatewayError::Rejected(format!(
                    "{} ({})",
                    api_error.msg, api_error.code
                )));
            }

            if status.is_server_error() && attempt < PLACEMENT_RETRIES {
                attempt += 1;
                tokio::time::sleep(std::time::Duration::from_millis(250 * attempt as u64)).await;
                continue;
            }
            return Err(GatewayError::Ambiguous(format!(
                "order placement failed with {}: {}",
                status, body
            )));
        }
    }

    pub(super) async fn cancel_exchange_order(
        &self,
        order_id: &str,
        symbol: &str,
    ) -> Result<(), GatewayError> {
        let params = vec![
            ("symbol", to_api_symbol(symbol)),
            ("orderId", order_id.to_string()),
        ];
        let signed = self.signed_query(params);
        let url = build_url(&self.base_url, "/api/v3/order", Some(&signed))?;

        let response = self
            .clients
            .order
            .delete(url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected(format!("cancel failed: {}", body)));
        }
        Ok(())
    }

    pub(super) async fn get_order(
        &self,
        order_id: &str,
        symbol: &str,
    ) -> Result<GatewayOrder, GatewayError> {
        let params = vec![
            ("symbol", to_api_symbol(symbol)),
            ("orderId", order_id.to_string()),
        ];
        let signed = self.signed_query(params);
        let url = build_url(&self.base_url, "/api/v3/order", Some(&signed))?;

        let response = self
            .clients
            .read
            .get(url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        if !response.status().is_success() {
            return Err(GatewayError::Transient(format!(
                "order lookup failed with {}",
                response.status()
            )));
        }

        let parsed: OrderResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        let request_shim = GatewayOrderRequest {
            symbol: symbol.to_string(),
            side: Side::Buy,
            order_type: OrderType::Market,
            quantity: 0.0,
            price: None,
            trigger_price: None,
            client_order_id: None,
        };
        Ok(self.order_from_response(parsed, &request_shim))
    }

    pub(super) async fn get_order_trades(
        &self,
        order_id: &str,
        symbol: &str,
    ) -> Result<Vec<FillRecord>, GatewayError> {
        let params = vec![
            ("symbol", to_api_symbol(symbol)),
            ("orderId", order_id.to_string()),
        ];
        let signed = self.signed_query(params);
        let url = build_url(&self.base_url, "/api/v3/myTrades", Some(&signed))?;

        let response = self
            .clients
            .read
            .get(url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        if !response.status().is_success() {
            return Err(GatewayError::Transient(format!(
                "trade lookup failed with {}",
                response.status()
            )));
        }

        let trades: Vec<TradeResponse> = response
            .json()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        Ok(trades
            .into_iter()
            .map(|t| FillRecord {
                fill_id: t.id.to_string(),
                order_id: t.order_id.to_string(),
                symbol: from_api_symbol(&t.symbol).unwrap_or_else(|| symbol.to_string()),
                side: if t.is_buyer { Side::Buy } else { Side::Sell },
                quantity: parse_f64(&t.qty),
                price: parse_f64(&t.price),
                cost: parse_f64(&t.quote_qty),
                fee: parse_f64(&t.commission),
                fee_currency: t.commission_asset,
                timestamp: Utc
                    .timestamp_millis_opt(t.time)
                    .single()
                    .unwrap_or_else(Utc::now),
                is_maker: t.is_maker,
            })
            .collect())
    }

    pub(super) async fn get_balance(&self) -> Result<Balance, GatewayError> {
        let account = self.get_account().await?;

        let mut free = HashMap::new();
        let mut total = HashMap::new();
        for balance in account.balances {
            let free_amount = parse_f64(&balance.free);
            let locked = parse_f64(&balance.locked);
            if free_amount > 0.0 || locked > 0.0 {
                free.insert(balance.asset.clone(), free_amount);
                total.insert(balance.asset, free_amount + locked);
            }
        }
        Ok(Balance { free, total })
    }

    /// Spot "positions" are non-quote balances held by the account.
    pub(super) async fn get_positions(&self) -> Result<Vec<GatewayPosition>, GatewayError> {
        let balance = self.get_balance().await?;
        Ok(balance
            .total
            .iter()
            .filter(|(asset, amount)| **amount > 0.0 && *asset != "USDT")
            .map(|(asset, amount)| GatewayPosition {
                symbol: format!("{}/USDT", asset),
                quantity: *amount,
                entry_price: None,
            })
            .collect())
    }

    async fn get_account(&self) -> Result<AccountResponse, GatewayError> {
        let signed = self.signed_query(Vec::new());
        let url = build_url(&self.base_url, "/api/v3/account", Some(&signed))?;

        let response = self
            .clients
            .read
            .get(url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        if !response.status().is_success() {
            return Err(GatewayError::Transient(format!(
                "account request failed with {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))
    }
}
