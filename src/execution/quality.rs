//! Execution quality: slippage, cost breakdown, and the composite
//! quality score for one fill group.

use crate::domain::types::Side;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityRating {
    Excellent,
    Good,
    Acceptable,
    Poor,
    VeryPoor,
}

impl QualityRating {
    /// Stepped rating by absolute slippage percentage.
    pub fn from_slippage_pct(abs_slippage_pct: f64) -> Self {
        if abs_slippage_pct < 0.1 {
            QualityRating::Excellent
        } else if abs_slippage_pct < 0.3 {
            QualityRating::Good
        } else if abs_slippage_pct < 0.5 {
            QualityRating::Acceptable
        } else if abs_slippage_pct < 1.0 {
            QualityRating::Poor
        } else {
            QualityRating::VeryPoor
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityRating::Excellent => "excellent",
            QualityRating::Good => "good",
            QualityRating::Acceptable => "acceptable",
            QualityRating::Poor => "poor",
            QualityRating::VeryPoor => "very_poor",
        }
    }
}

/// Sign-corrected slippage analysis: positive slippage is always
/// unfavorable, whichever the side.
#[derive(Debug, Clone, PartialEq)]
pub struct SlippageAnalysis {
    pub expected_price: f64,
    pub actual_price: f64,
    pub slippage_amount: f64,
    pub slippage_pct: f64,
    pub slippage_bps: f64,
    pub cost_impact: f64,
    pub quality_rating: QualityRating,
    pub is_favorable: bool,
}

pub fn analyze_slippage(
    expected_price: f64,
    actual_price: f64,
    quantity: f64,
    side: Side,
) -> SlippageAnalysis {
    let mut slippage_amount = actual_price - expected_price;
    // A sell filling below the expected price hurts the same way a
    // buy filling above it does.
    if side == Side::Sell {
        slippage_amount = -slippage_amount;
    }

    let slippage_pct = if expected_price != 0.0 {
        slippage_amount / expected_price * 100.0
    } else {
        0.0
    };
    let slippage_bps = slippage_pct * 100.0;
    let cost_impact = (slippage_amount * quantity).abs();

    SlippageAnalysis {
        expected_price,
        actual_price,
        slippage_amount,
        slippage_pct,
        slippage_bps,
        cost_impact,
        quality_rating: QualityRating::from_slippage_pct(slippage_pct.abs()),
        is_favorable: slippage_amount < 0.0,
    }
}

/// Total cost of an execution relative to its expectation.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionCost {
    pub quantity: f64,
    pub gross_cost: f64,
    pub slippage_cost: f64,
    pub exchange_fees: f64,
    pub total_cost: f64,
    pub cost_per_unit: f64,
    pub cost_pct: f64,
}

pub fn analyze_cost(
    quantity: f64,
    average_price: f64,
    expected_price: f64,
    exchange_fees: f64,
    side: Side,
) -> ExecutionCost {
    let gross_cost = quantity * average_price;

    let mut slippage_amount = average_price - expected_price;
    if side == Side::Sell {
        slippage_amount = -slippage_amount;
    }
    let slippage_cost = slippage_amount * quantity;

    let total_cost = gross_cost + exchange_fees + slippage_cost.abs();
    let cost_per_unit = if quantity > 0.0 {
        total_cost / quantity
    } else {
        0.0
    };
    let cost_pct = if gross_cost > 0.0 {
        (exchange_fees + slippage_cost.abs()) / gross_cost * 100.0
    } else {
        0.0
    };

    ExecutionCost {
        quantity,
        gross_cost,
        slippage_cost,
        exchange_fees,
        total_cost,
        cost_per_unit,
        cost_pct,
    }
}

/// Full quality report for one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityReport {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub expected_price: f64,
    pub average_fill_price: f64,
    pub slippage: SlippageAnalysis,
    pub costs: ExecutionCost,
    pub execution_time_ms: f64,
    pub quality_score: f64,
}

#[allow(clippy::too_many_arguments)]
pub fn build_report(
    order_id: &str,
    symbol: &str,
    side: Side,
    quantity: f64,
    expected_price: f64,
    average_fill_price: f64,
    exchange_fees: f64,
    execution_time_ms: f64,
) -> QualityReport {
    let slippage = analyze_slippage(expected_price, average_fill_price, quantity, side);
    let costs = analyze_cost(
        quantity,
        average_fill_price,
        expected_price,
        exchange_fees,
        side,
    );
    let quality_score = quality_score(&slippage, &costs, execution_time_ms);

    QualityReport {
        order_id: order_id.to_string(),
        symbol: symbol.to_string(),
        side,
        quantity,
        expected_price,
        average_fill_price,
        slippage,
        costs,
        execution_time_ms,
        quality_score,
    }
}

/// Composite score: 50% slippage, 30% cost, 20% speed, each a
/// stepped 0-100 sub-score, rounded to one decimal.
pub fn quality_score(
    slippage: &SlippageAnalysis,
    costs: &ExecutionCost,
    execution_time_ms: f64,
) -> f64 {
    let abs_slippage_pct = slippage.slippage_pct.abs();
    let slippage_score = if abs_slippage_pct < 0.1 {
        100.0
    } else if abs_slippage_pct < 0.3 {
        80.0
    } else if abs_slippage_pct < 0.5 {
        60.0
    } else if abs_slippage_pct < 1.0 {
        40.0
    } else {
        (20.0 - (abs_slippage_pct - 1.0) * 10.0).max(0.0)
    };

    let cost_pct = costs.cost_pct;
    let cost_score = if cost_pct < 0.1 {
        100.0
    } else if cost_pct < 0.3 {
        80.0
    } else if cost_pct < 0.5 {
        60.0
    } else {
        (40.0 - (cost_pct - 0.5) * 20.0).max(0.0)
    };

    let speed_score = if execution_time_ms < 1000.0 {
        100.0
    } else if execution_time_ms < 5000.0 {
        80.0
    } else if execution_time_ms < 10000.0 {
        60.0
    } else if execution_time_ms < 30000.0 {
        40.0
    } else {
        20.0
    };

    let score = slippage_score * 0.5 + cost_score * 0.3 + speed_score * 0.2;
    (score * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buy_slippage_above_expected_is_unfavorable() {
        let slippage = analyze_slippage(50000.0, 50600.0, 0.1, Side::Buy);
        assert!((slippage.slippage_pct - 1.2).abs() < 1e-9);
        assert!((slippage.slippage_bps - 120.0).abs() < 1e-9);
        assert!((slippage.cost_impact - 60.0).abs() < 1e-9);
        assert_eq!(slippage.quality_rating, QualityRating::VeryPoor);
        assert!(!slippage.is_favorable);
    }

    #[test]
    fn test_sell_slippage_sign_corrected() {
        // Selling below expectation is unfavorable.
        let below = analyze_slippage(50000.0, 49500.0, 0.1, Side::Sell);
        assert!(below.slippage_amount > 0.0);
        assert!(!below.is_favorable);

        // Selling above expectation is favorable.
        let above = analyze_slippage(50000.0, 50200.0, 0.1, Side::Sell);
        assert!(above.slippage_amount < 0.0);
        assert!(above.is_favorable);
    }

    #[test]
    fn test_rating_thresholds() {
        assert_eq!(QualityRating::from_slippage_pct(0.05), QualityRating::Excellent);
        assert_eq!(QualityRating::from_slippage_pct(0.2), QualityRating::Good);
        assert_eq!(QualityRating::from_slippage_pct(0.4), QualityRating::Acceptable);
        assert_eq!(QualityRating::from_slippage_pct(0.8), QualityRating::Poor);
        assert_eq!(QualityRating::from_slippage_pct(1.5), QualityRating::VeryPoor);
    }

    #[test]
    fn test_cost_breakdown() {
        let costs = analyze_cost(0.1, 50600.0, 50000.0, 5.06, Side::Buy);
        assert!((costs.gross_cost - 5060.0).abs() < 1e-9);
        assert!((costs.slippage_cost - 60.0).abs() < 1e-9);
        assert!((costs.total_cost - (5060.0 + 5.06 + 60.0)).abs() < 1e-9);
        assert!(costs.cost_pct > 1.0);
    }

    #[test]
    fn test_quality_score_scenario_very_poor_slippage() {
        // Expected 50000, filled 50600, qty 0.1, BUY: slippage 1.2%.
        let report = build_report(
            "order-1",
            "BTC/USDT",
            Side::Buy,
            0.1,
            50000.0,
            50600.0,
            0.0,
            500.0,
        );
        assert_eq!(report.slippage.quality_rating, QualityRating::VeryPoor);
        // slip_score = 20 - 0.2*10 = 18; cost_pct ~1.19 -> cost_score
        // ~26.3; speed 100 -> total ~ 0.5*18 + 0.3*26.3 + 0.2*100.
        assert!(report.quality_score <= 60.0);
        assert!(report.quality_score > 0.0);
    }

    #[test]
    fn test_quality_score_perfect_execution() {
        let report = build_report(
            "order-2",
            "BTC/USDT",
            Side::Buy,
            0.1,
            50000.0,
            50000.0,
            0.0,
            200.0,
        );
        assert_eq!(report.quality_score, 100.0);
        assert_eq!(report.slippage.quality_rating, QualityRating::Excellent);
    }

    #[test]
    fn test_quality_score_rounded_to_one_decimal() {
        let report = build_report(
            "order-3",
            "ETH/USDT",
            Side::Sell,
            1.0,
            2500.0,
            2495.0,
            1.25,
            1200.0,
        );
        let scaled = report.quality_score * 10.0;
        assert!((scaled - scaled.round()).abs() < 1e-9);
    }

    #[test]
    fn test_zero_quantity_does_not_divide_by_zero() {
        let costs = analyze_cost(0.0, 50000.0, 50000.0, 0.0, Side::Buy);
        assert_eq!(costs.cost_per_unit, 0.0);
        assert_eq!(costs.cost_pct, 0.0);
    }
}
