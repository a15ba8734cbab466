//! Stop-loss and take-profit placement.
//!
//! When the intent carries explicit levels they pass through
//! untouched; otherwise the configured method computes them from
//! price and whatever market context is available, falling back to
//! the fixed-percentage method when the context is missing.

use crate::domain::types::Side;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMethod {
    Atr,
    Percentage,
    Volatility,
    SupportResistance,
    Trailing,
}

impl FromStr for StopMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "atr" => Ok(StopMethod::Atr),
            "percentage" => Ok(StopMethod::Percentage),
            "volatility" => Ok(StopMethod::Volatility),
            "support_resistance" => Ok(StopMethod::SupportResistance),
            "trailing" => Ok(StopMethod::Trailing),
            _ => anyhow::bail!("Unknown stop-loss method: {}", s),
        }
    }
}

/// Computed protective levels for one trade.
#[derive(Debug, Clone, PartialEq)]
pub struct StopLevels {
    pub stop_loss: f64,
    pub take_profit: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub reward_risk_ratio: f64,
    pub method: String,
    pub reasoning: String,
}

/// Inputs available when placing stops.
#[derive(Debug, Clone, Default)]
pub struct StopContext {
    pub atr: Option<f64>,
    pub price_std: Option<f64>,
    pub support: Option<f64>,
    pub resistance: Option<f64>,
    pub custom_stop: Option<f64>,
    pub custom_tp: Option<f64>,
}

/// Stop placement engine with per-method parameters.
#[derive(Debug, Clone)]
pub struct StopPlanner {
    pub default_method: StopMethod,
    pub rr_ratio: f64,
    pub atr_multiplier: f64,
    pub stop_pct: f64,
    pub std_multiplier: f64,
    pub buffer_pct: f64,
    pub trail_pct: f64,
    pub activation_pct: f64,
}

impl StopPlanner {
    pub fn new(default_method: StopMethod, rr_ratio: f64) -> Self {
        Self {
            default_method,
            rr_ratio,
            atr_multiplier: 2.0,
            stop_pct: 0.05,
            std_multiplier: 2.0,
            buffer_pct: 0.01,
            trail_pct: 0.03,
            activation_pct: 0.05,
        }
    }

    /// Place stop-loss and take-profit for a trade at `price`.
    pub fn place(&self, price: f64, side: Side, ctx: &StopContext) -> StopLevels {
        let (stop_loss, take_profit, method) = if let (Some(stop), Some(tp)) =
            (ctx.custom_stop, ctx.custom_tp)
        {
            (stop, tp, "Custom Levels")
        } else {
            match self.default_method {
                StopMethod::Atr if ctx.atr.is_some() => {
                    let distance = ctx.atr.unwrap_or_default() * self.atr_multiplier;
                    let (stop, tp) = self.distance_stops(price, distance, side);
                    (stop, tp, "ATR-based")
                }
                StopMethod::Volatility if ctx.price_std.is_some() => {
                    let distance = ctx.price_std.unwrap_or_default() * self.std_multiplier;
                    let (stop, tp) = self.distance_stops(price, distance, side);
                    (stop, tp, "Volatility-based")
                }
                StopMethod::SupportResistance
                    if ctx.support.is_some() && ctx.resistance.is_some() =>
                {
                    let (stop, tp) = self.support_resistance_stops(
                        price,
                        ctx.support.unwrap_or_default(),
                        ctx.resistance.unwrap_or_default(),
                        side,
                    );
                    (stop, tp, "Support/Resistance")
                }
                StopMethod::Trailing => {
                    let (stop, tp) = self.trailing_initial(price, side);
                    (stop, tp, "Trailing (initial)")
                }
                // Percentage, or any method whose context is missing.
                _ => {
                    let (stop, tp) = self.percentage_stops(price, side);
                    (stop, tp, "Fixed Percentage")
                }
            }
        };

        let (stop_loss_pct, take_profit_pct) = match side {
            Side::Buy => (
                (price - stop_loss).abs() / price,
                (take_profit - price).abs() / price,
            ),
            Side::Sell => (
                (stop_loss - price).abs() / price,
                (price - take_profit).abs() / price,
            ),
        };

        let reward_risk_ratio = if stop_loss_pct > 0.0 {
            take_profit_pct / stop_loss_pct
        } else {
            1.0
        };

        let reasoning = format!(
            "Stop: {:.2} ({:.1}%) | TP: {:.2} ({:.1}%) | R/R: {:.2}:1 | Method: {}",
            stop_loss,
            stop_loss_pct * 100.0,
            take_profit,
            take_profit_pct * 100.0,
            reward_risk_ratio,
            method
        );

        StopLevels {
            stop_loss,
            take_profit,
            stop_loss_pct,
            take_profit_pct,
            reward_risk_ratio,
            method: method.to_string(),
            reasoning,
        }
    }

    fn distance_stops(&self, price: f64, distance: f64, side: Side) -> (f64, f64) {
        match side {
            Side::Buy => (price - distance, price + distance * self.rr_ratio),
            Side::Sell => (price + distance, price - distance * self.rr_ratio),
        }
    }

    fn percentage_stops(&self, price: f64, side: Side) -> (f64, f64) {
        match side {
            Side::Buy => (
                price * (1.0 - self.stop_pct),
                price * (1.0 + self.stop_pct * self.rr_ratio),
            ),
            Side::Sell => (
                price * (1.0 + self.stop_pct),
                price * (1.0 - self.stop_pct * self.rr_ratio),
            ),
        }
    }

    fn support_resistance_stops(
        &self,
        price: f64,
        support: f64,
        resistance: f64,
        side: Side,
    ) -> (f64, f64) {
        match side {
            Side::Buy => {
                let stop = support * (1.0 - self.buffer_pct);
                let risk = price - stop;
                let tp_by_rr = price + risk * self.rr_ratio;
                let tp_by_level = resistance * (1.0 - self.buffer_pct);
                (stop, tp_by_rr.max(tp_by_level))
            }
            Side::Sell => {
                let stop = resistance * (1.0 + self.buffer_pct);
                let risk = stop - price;
                let tp_by_rr = price - risk * self.rr_ratio;
                let tp_by_level = support * (1.0 + self.buffer_pct);
                (stop, tp_by_rr.min(tp_by_level))
            }
        }
    }

    fn trailing_initial(&self, price: f64, side: Side) -> (f64, f64) {
        match side {
            Side::Buy => (
                price * (1.0 - self.trail_pct),
                price * (1.0 + self.trail_pct * self.rr_ratio),
            ),
            Side::Sell => (
                price * (1.0 + self.trail_pct),
                price * (1.0 - self.trail_pct * self.rr_ratio),
            ),
        }
    }

    /// Price at which a trailing stop starts ratcheting.
    pub fn trailing_activation(&self, entry_price: f64, side: Side) -> f64 {
        match side {
            Side::Buy => entry_price * (1.0 + self.activation_pct),
            Side::Sell => entry_price * (1.0 - self.activation_pct),
        }
    }

    /// One-way trailing stop update: once the position has moved
    /// `activation_pct` in its favor the stop follows the price at
    /// `trail_pct` distance and only ever moves toward profit.
    pub fn trailing_update(
        &self,
        current_price: f64,
        current_stop: f64,
        entry_price: f64,
        side: Side,
    ) -> f64 {
        match side {
            Side::Buy => {
                if current_price >= entry_price * (1.0 + self.activation_pct) {
                    let new_stop = current_price * (1.0 - self.trail_pct);
                    return current_stop.max(new_stop);
                }
                current_stop
            }
            Side::Sell => {
                if current_price <= entry_price * (1.0 - self.activation_pct) {
                    let new_stop = current_price * (1.0 + self.trail_pct);
                    return current_stop.min(new_stop);
                }
                current_stop
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner(method: StopMethod) -> StopPlanner {
        StopPlanner::new(method, 2.0)
    }

    #[test]
    fn test_atr_stops_buy() {
        let levels = planner(StopMethod::Atr).place(
            50000.0,
            Side::Buy,
            &StopContext {
                atr: Some(1000.0),
                ..Default::default()
            },
        );
        assert_eq!(levels.stop_loss, 48000.0);
        assert_eq!(levels.take_profit, 54000.0);
        assert!((levels.reward_risk_ratio - 2.0).abs() < 1e-9);
        // LONG invariant: stop below entry, take-profit above.
        assert!(levels.stop_loss < 50000.0 && 50000.0 < levels.take_profit);
    }

    #[test]
    fn test_atr_stops_sell_inverted() {
        let levels = planner(StopMethod::Atr).place(
            50000.0,
            Side::Sell,
            &StopContext {
                atr: Some(1000.0),
                ..Default::default()
            },
        );
        assert_eq!(levels.stop_loss, 52000.0);
        assert_eq!(levels.take_profit, 46000.0);
        assert!(levels.take_profit < 50000.0 && 50000.0 < levels.stop_loss);
    }

    #[test]
    fn test_atr_without_context_falls_back_to_percentage() {
        let levels = planner(StopMethod::Atr).place(100.0, Side::Buy, &StopContext::default());
        assert_eq!(levels.method, "Fixed Percentage");
        assert!((levels.stop_loss - 95.0).abs() < 1e-9);
        assert!((levels.take_profit - 110.0).abs() < 1e-9);
    }

    #[test]
    fn test_custom_levels_bypass_method() {
        let levels = planner(StopMethod::Atr).place(
            50000.0,
            Side::Buy,
            &StopContext {
                atr: Some(1000.0),
                custom_stop: Some(47500.0),
                custom_tp: Some(55000.0),
                ..Default::default()
            },
        );
        assert_eq!(levels.method, "Custom Levels");
        assert_eq!(levels.stop_loss, 47500.0);
        assert_eq!(levels.take_profit, 55000.0);
    }

    #[test]
    fn test_volatility_stops() {
        let levels = planner(StopMethod::Volatility).place(
            200.0,
            Side::Buy,
            &StopContext {
                price_std: Some(5.0),
                ..Default::default()
            },
        );
        assert_eq!(levels.stop_loss, 190.0);
        assert_eq!(levels.take_profit, 220.0);
    }

    #[test]
    fn test_support_resistance_buy() {
        let levels = planner(StopMethod::SupportResistance).place(
            100.0,
            Side::Buy,
            &StopContext {
                support: Some(95.0),
                resistance: Some(118.0),
                ..Default::default()
            },
        );
        // Stop just below support with the 1% buffer.
        assert!((levels.stop_loss - 94.05).abs() < 1e-9);
        // TP is the further of rr-based (111.9) and buffered
        // resistance (116.82).
        assert!((levels.take_profit - 116.82).abs() < 1e-9);
    }

    #[test]
    fn test_trailing_initial_and_ratchet() {
        let planner = planner(StopMethod::Trailing);
        let levels = planner.place(100.0, Side::Buy, &StopContext::default());
        assert!((levels.stop_loss - 97.0).abs() < 1e-9);

        // Below activation: stop stays put.
        let unchanged = planner.trailing_update(104.0, 97.0, 100.0, Side::Buy);
        assert_eq!(unchanged, 97.0);

        // Past activation: stop follows the price up.
        let raised = planner.trailing_update(110.0, 97.0, 100.0, Side::Buy);
        assert!((raised - 106.7).abs() < 1e-9);

        // Price dips: the stop never retreats.
        let held = planner.trailing_update(107.0, raised, 100.0, Side::Buy);
        assert_eq!(held, raised);
    }

    #[test]
    fn test_trailing_short_ratchets_down() {
        let planner = planner(StopMethod::Trailing);
        let lowered = planner.trailing_update(90.0, 103.0, 100.0, Side::Sell);
        assert!((lowered - 92.7).abs() < 1e-9);
        let held = planner.trailing_update(95.0, lowered, 100.0, Side::Sell);
        assert_eq!(held, lowered);
    }

    #[test]
    fn test_pct_and_rr_outputs() {
        let levels = planner(StopMethod::Percentage).place(100.0, Side::Sell, &StopContext::default());
        assert!((levels.stop_loss_pct - 0.05).abs() < 1e-9);
        assert!((levels.take_profit_pct - 0.10).abs() < 1e-9);
        assert!((levels.reward_risk_ratio - 2.0).abs() < 1e-9);
    }
}
