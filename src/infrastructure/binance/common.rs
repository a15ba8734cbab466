//! Shared plumbing for the Binance adapter: symbol conversion,
//! status normalization, request signing, and HTTP client
//! construction.

use crate::domain::errors::GatewayError;
use crate::domain::types::OrderStatus;
use hmac::{Hmac, Mac};
use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use sha2::Sha256;
use std::time::Duration;
use url::Url;

const QUOTE_ASSETS: &[&str] = &["USDT", "BUSD", "USDC", "FDUSD", "BTC", "ETH", "BNB"];

/// "BTC/USDT" -> "BTCUSDT".
pub fn to_api_symbol(symbol: &str) -> String {
    symbol.replace('/', "")
}

/// "BTCUSDT" -> "BTC/USDT", matching on known quote assets.
pub fn from_api_symbol(api_symbol: &str) -> Option<String> {
    for quote in QUOTE_ASSETS {
        if let Some(base) = api_symbol.strip_suffix(quote)
            && !base.is_empty()
        {
            return Some(format!("{}/{}", base, quote));
        }
    }
    None
}

/// Map a Binance order status string to the normalized set.
pub fn map_status(status: &str) -> OrderStatus {
    match status {
        "NEW" | "PENDING_NEW" | "PENDING_CANCEL" => OrderStatus::Open,
        "PARTIALLY_FILLED" => OrderStatus::Partial,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" | "CANCELLED" => OrderStatus::Cancelled,
        "REJECTED" => OrderStatus::Rejected,
        "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Expired,
        _ => OrderStatus::Open,
    }
}

/// Assemble a checked endpoint URL from the configured base, an API
/// path, and an optional pre-built query string.
pub fn build_url(base: &str, path: &str, query: Option<&str>) -> Result<Url, GatewayError> {
    let mut url = Url::parse(base)
        .map_err(|e| GatewayError::Transient(format!("invalid base url {}: {}", base, e)))?;
    url.set_path(path);
    url.set_query(query);
    Ok(url)
}

/// HMAC-SHA256 signature over the query string, hex-encoded.
pub fn sign(secret: &str, query_string: &str) -> String {
    type HmacSha256 = Hmac<Sha256>;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(query_string.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Classify a transport error for the placement path: errors before
/// the request could have reached the exchange are retriable, errors
/// after are ambiguous.
pub fn classify_send_error(error: &reqwest::Error) -> GatewayError {
    if error.is_connect() || error.is_timeout() {
        GatewayError::Transient(error.to_string())
    } else {
        GatewayError::Ambiguous(error.to_string())
    }
}

/// The two HTTP clients the adapter uses: a retrying one for reads
/// and a bare one for order placement, which manages its own narrow
/// retry loop.
pub struct HttpClients {
    pub read: ClientWithMiddleware,
    pub order: Client,
}

impl HttpClients {
    pub fn create() -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);

        let base = Client::builder()
            .pool_max_idle_per_host(5)
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        let read = ClientBuilder::new(base.clone())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self { read, order: base }
    }
}

/// Parse a Binance string-encoded number.
pub fn parse_f64(raw: &str) -> f64 {
    raw.parse().unwrap_or_default()
}
