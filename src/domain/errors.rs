use thiserror::Error;

/// Errors decoding bus traffic. Neither variant ever tears down a
/// worker; the runtime logs and drops the offending delivery.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message type tag: {0}")]
    UnknownType(String),

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Errors raised by the message bus port.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("queue {queue} is full ({depth} messages)")]
    QueueFull { queue: String, depth: usize },

    #[error("bus is closed")]
    Closed,
}

/// Errors raised by the exchange gateway port, classified so callers
/// and the adapter retry policy can tell transient trouble from
/// domain rejections and from ambiguous (possibly-executed) failures.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Network error, timeout, or exchange unavailability. Safe to
    /// retry for reads; order placement retries before the request is
    /// known to have reached the exchange.
    #[error("transient gateway error: {0}")]
    Transient(String),

    /// The exchange understood the request and said no (insufficient
    /// balance, bad quantity, unknown symbol). Never retried.
    #[error("rejected by exchange: {0}")]
    Rejected(String),

    /// The request may or may not have been applied (connection died
    /// after send). Never retried; surfaced immediately.
    #[error("ambiguous gateway failure: {0}")]
    Ambiguous(String),

    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}
