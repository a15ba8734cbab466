use crate::domain::messages::TradingSignal;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// A signal held in a symbol buffer, stamped with its origin time and
/// the chain it belongs to.
#[derive(Debug, Clone)]
pub struct BufferedSignal {
    pub signal: TradingSignal,
    pub timestamp: DateTime<Utc>,
    pub source_worker: String,
    pub correlation_id: Option<String>,
}

impl BufferedSignal {
    pub fn age_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.timestamp
    }
}

/// Per-symbol collection point for incoming signals. Owned by the
/// fusion worker task; buffer mutation and decision evaluation never
/// interleave.
#[derive(Debug, Default)]
pub struct SignalBuffer {
    pub signals: Vec<BufferedSignal>,
    pub last_decision: Option<DateTime<Utc>>,
    pub pending_count: usize,
}

impl SignalBuffer {
    pub fn push(&mut self, signal: BufferedSignal) {
        self.signals.push(signal);
        self.pending_count += 1;
    }

    /// Signals younger than `timeout` as of `now`.
    pub fn recent(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<&BufferedSignal> {
        let max_age = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        self.signals
            .iter()
            .filter(|s| s.age_at(now) <= max_age)
            .collect()
    }

    /// Drop signals older than `timeout`; returns how many were
    /// removed.
    pub fn prune(&mut self, now: DateTime<Utc>, timeout: Duration) -> usize {
        let max_age = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        let before = self.signals.len();
        self.signals.retain(|s| s.age_at(now) <= max_age);
        before - self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::SignalKind;
    use serde_json::Map;

    fn buffered(kind: SignalKind, age_secs: i64, now: DateTime<Utc>) -> BufferedSignal {
        BufferedSignal {
            signal: TradingSignal {
                agent_type: "technical".to_string(),
                symbol: "BTC/USDT".to_string(),
                signal: kind,
                confidence: 0.7,
                price_target: None,
                stop_loss: None,
                take_profit: None,
                reasoning: None,
                indicators: Map::new(),
            },
            timestamp: now - chrono::Duration::seconds(age_secs),
            source_worker: "tech_1".to_string(),
            correlation_id: None,
        }
    }

    #[test]
    fn test_push_increments_pending() {
        let now = Utc::now();
        let mut buffer = SignalBuffer::default();
        buffer.push(buffered(SignalKind::Buy, 0, now));
        buffer.push(buffered(SignalKind::Sell, 0, now));
        assert_eq!(buffer.pending_count, 2);
        assert_eq!(buffer.signals.len(), 2);
    }

    #[test]
    fn test_recent_filters_by_age() {
        let now = Utc::now();
        let mut buffer = SignalBuffer::default();
        buffer.push(buffered(SignalKind::Buy, 10, now));
        buffer.push(buffered(SignalKind::Buy, 400, now));

        let recent = buffer.recent(now, Duration::from_secs(300));
        assert_eq!(recent.len(), 1);
    }

    #[test]
    fn test_prune_retains_only_fresh_signals() {
        let now = Utc::now();
        let mut buffer = SignalBuffer::default();
        buffer.push(buffered(SignalKind::Buy, 10, now));
        buffer.push(buffered(SignalKind::Sell, 301, now));
        buffer.push(buffered(SignalKind::Hold, 9000, now));

        let removed = buffer.prune(now, Duration::from_secs(300));
        assert_eq!(removed, 2);

        // Janitor invariant: everything retained is within the
        // timeout window.
        let timeout = chrono::Duration::seconds(300);
        assert!(buffer.signals.iter().all(|s| s.age_at(now) <= timeout));
    }

    #[test]
    fn test_age_boundary_is_inclusive() {
        let now = Utc::now();
        let mut buffer = SignalBuffer::default();
        buffer.push(buffered(SignalKind::Buy, 300, now));
        assert_eq!(buffer.recent(now, Duration::from_secs(300)).len(), 1);
        assert_eq!(buffer.prune(now, Duration::from_secs(300)), 0);
    }
}
