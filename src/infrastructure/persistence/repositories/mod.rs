mod assessment_repository;
mod decision_repository;
mod order_repository;
mod position_repository;
mod signal_repository;
mod trade_repository;
mod worker_config_repository;

pub use assessment_repository::SqliteAssessmentRepository;
pub use decision_repository::SqliteDecisionRepository;
pub use order_repository::SqliteOrderRepository;
pub use position_repository::SqlitePositionRepository;
pub use signal_repository::SqliteSignalRepository;
pub use trade_repository::SqliteTradeRepository;
pub use worker_config_repository::SqliteWorkerConfigRepository;

use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use std::str::FromStr;

/// Monetary values cross the store boundary as decimal strings,
/// rounded to eight places.
pub(crate) fn decimal_string(value: f64) -> String {
    Decimal::from_f64(value)
        .map(|d| d.round_dp(8))
        .unwrap_or_default()
        .to_string()
}

pub(crate) fn parse_decimal(raw: &str) -> f64 {
    Decimal::from_str(raw)
        .ok()
        .and_then(|d| d.to_f64())
        .unwrap_or_default()
}

pub(crate) fn optional_decimal_string(value: Option<f64>) -> Option<String> {
    value.map(decimal_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_round_trip() {
        assert_eq!(parse_decimal(&decimal_string(50000.5)), 50000.5);
        assert_eq!(parse_decimal(&decimal_string(0.00000012)), 0.00000012);
        assert_eq!(parse_decimal("garbage"), 0.0);
    }
}
