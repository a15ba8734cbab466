//! Inter-worker wire protocol.
//!
//! Every message crossing the bus is a JSON object with a common
//! envelope (version, timestamp, source worker, optional correlation
//! id, metadata) and a `type` tag selecting the payload variant.
//! Unknown fields are ignored; unknown tags surface as
//! [`ProtocolError::UnknownType`] so the runtime can drop-and-log.

use crate::domain::errors::ProtocolError;
use crate::domain::types::{OrderStatus, OrderType, PositionSide, Side, SignalKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const PROTOCOL_VERSION: &str = "1.0";

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

fn default_leverage() -> f64 {
    1.0
}

/// Common envelope carried by every bus message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default = "default_version")]
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub source_worker: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Envelope {
    pub fn new(source_worker: impl Into<String>, payload: Payload) -> Self {
        Self {
            version: default_version(),
            timestamp: Utc::now(),
            source_worker: source_worker.into(),
            correlation_id: None,
            metadata: Map::new(),
            payload,
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a raw bus delivery. A missing or unrecognized `type`
    /// tag is reported as [`ProtocolError::UnknownType`] rather than a
    /// generic parse failure so callers can distinguish foreign
    /// traffic from corrupt payloads.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| ProtocolError::UnknownType("<missing>".to_string()))?;
        if !KNOWN_TYPES.contains(&tag.as_str()) {
            return Err(ProtocolError::UnknownType(tag));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Convenience accessor for a float stashed in envelope metadata.
    pub fn metadata_f64(&self, key: &str) -> Option<f64> {
        self.metadata.get(key).and_then(Value::as_f64)
    }
}

const KNOWN_TYPES: &[&str] = &[
    "market.data",
    "signal",
    "trade.intent",
    "order",
    "execution.report",
    "position.update",
    "risk.assessment",
];

/// Message payloads, discriminated by the wire-level `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Payload {
    #[serde(rename = "market.data")]
    MarketData(MarketData),
    #[serde(rename = "signal")]
    Signal(TradingSignal),
    #[serde(rename = "trade.intent")]
    Intent(TradeIntent),
    #[serde(rename = "order")]
    Order(OrderRequest),
    #[serde(rename = "execution.report")]
    Execution(ExecutionReport),
    #[serde(rename = "position.update")]
    Position(PositionUpdate),
    #[serde(rename = "risk.assessment")]
    Risk(RiskAssessment),
}

/// Raw market data from the collection workers. The payload map is
/// self-describing (`{"type": "ticker" | "ohlcv", ...}`); the core
/// never interprets it beyond routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketData {
    pub exchange: String,
    pub symbol: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Analytical signal from a signal-producing worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingSignal {
    /// Class of the producing worker ("technical", "sentiment", ...).
    pub agent_type: String,
    pub symbol: String,
    pub signal: SignalKind,
    /// Strength of the signal in [0, 1].
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_target: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub indicators: Map<String, Value>,
}

/// Directional decision from the fusion core, pre-sizing. `quantity`
/// is zero until the risk core fills it in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeIntent {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub expected_price: f64,
    #[serde(default)]
    pub signals: Vec<TradingSignal>,
    pub strategy_name: String,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

/// Risk-approved order destined for the execution core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub exchange: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    #[serde(default = "default_leverage")]
    pub leverage: f64,
    pub risk_approved: bool,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub risk_params: Map<String, Value>,
}

impl OrderRequest {
    /// Price the risk core saw when it approved the order; used for
    /// slippage accounting on market orders where `price` is unset.
    pub fn expected_price(&self) -> Option<f64> {
        self.price
            .or_else(|| self.risk_params.get("expected_price").and_then(Value::as_f64))
    }
}

/// Outcome of exchange activity for one order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub order_id: String,
    pub exchange: String,
    pub symbol: String,
    pub side: Side,
    pub status: OrderStatus,
    pub filled_quantity: f64,
    pub average_price: f64,
    pub total_value: f64,
    pub fee: f64,
    pub fee_currency: String,
    pub execution_time: DateTime<Utc>,
}

/// Snapshot of a position after a state change or price refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
}

/// Risk verdict for an intent. Published on `trade.rejection` when a
/// trade is declined; the correlation id threads back to the intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub symbol: String,
    pub approved: bool,
    pub risk_score: f64,
    pub position_size: f64,
    pub var_estimate: f64,
    pub max_loss: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub risk_metrics: Map<String, Value>,
}
