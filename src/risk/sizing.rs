//! Position sizing: Kelly, fixed-fractional, volatility-based, and
//! the conservative hybrid the pipeline defaults to, followed by the
//! portfolio-risk headroom shrink and the final per-position cap.

use std::str::FromStr;

const RISK_PER_TRADE: f64 = 0.02;
const KELLY_MIN: f64 = 0.01;
const KELLY_MAX: f64 = 0.25;
const KELLY_CONFIDENCE_FLOOR: f64 = 0.5;
const DEFAULT_RR_RATIO: f64 = 1.5;
const DEFAULT_STOP_PCT: f64 = 0.05;
const ATR_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingMethod {
    Kelly,
    Fixed,
    Volatility,
    Hybrid,
}

impl FromStr for SizingMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "kelly" => Ok(SizingMethod::Kelly),
            "fixed" => Ok(SizingMethod::Fixed),
            "volatility" => Ok(SizingMethod::Volatility),
            "hybrid" => Ok(SizingMethod::Hybrid),
            _ => anyhow::bail!("Unknown position sizing method: {}", s),
        }
    }
}

/// Sizing result handed to validation and, on approval, the order.
#[derive(Debug, Clone, PartialEq)]
pub struct SizedPosition {
    /// Quantity in base currency.
    pub quantity: f64,
    /// Size in quote currency.
    pub size_usd: f64,
    /// Amount at risk between entry and stop.
    pub risk_amount: f64,
    /// Fraction of the account the size represents.
    pub kelly_fraction: f64,
    pub method: String,
    pub reasoning: String,
    pub win_probability: f64,
    pub reward_risk_ratio: f64,
    pub stop_loss_pct: f64,
}

/// Inputs for one sizing decision.
#[derive(Debug, Clone)]
pub struct SizingRequest {
    pub price: f64,
    pub confidence: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub atr: Option<f64>,
    pub current_portfolio_risk: f64,
}

/// Kelly criterion, clamped far below full Kelly.
///
/// `f* = (p*b - (1 - p)) / b` with `p` the win probability and `b`
/// the reward/risk ratio.
pub fn kelly_fraction(win_probability: f64, reward_risk_ratio: f64) -> f64 {
    if win_probability <= 0.0 || win_probability >= 1.0 || reward_risk_ratio <= 0.0 {
        return KELLY_MIN;
    }

    let lose_probability = 1.0 - win_probability;
    let raw = (win_probability * reward_risk_ratio - lose_probability) / reward_risk_ratio;
    let mut clamped = raw.clamp(KELLY_MIN, KELLY_MAX);

    // Half Kelly when the edge is not actually in our favor.
    if win_probability < KELLY_CONFIDENCE_FLOOR {
        clamped *= 0.5;
    }
    clamped
}

/// Map fused confidence to a win probability: 0.60 confidence maps
/// to 53%, 0.80 to 59%, hard-clamped to [0.51, 0.70].
pub fn win_probability(confidence: f64) -> f64 {
    (0.50 + (confidence - 0.5) * 0.30).clamp(0.51, 0.70)
}

/// Main position sizing coordinator.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    pub account_balance: f64,
    pub max_position_pct: f64,
    pub max_total_risk: f64,
    pub default_method: SizingMethod,
}

impl PositionSizer {
    /// `max_position_pct` follows the small-account schedule: tiny
    /// accounts need a large cap to clear exchange minimums.
    pub fn new(account_balance: f64, max_total_risk: f64, default_method: SizingMethod) -> Self {
        let max_position_pct = if account_balance < 100.0 {
            0.80
        } else if account_balance < 1000.0 {
            0.30
        } else {
            0.10
        };
        Self {
            account_balance,
            max_position_pct,
            max_total_risk,
            default_method,
        }
    }

    pub fn size(&self, request: &SizingRequest) -> SizedPosition {
        let price = request.price;

        let reward_risk_ratio = match (request.stop_loss, request.take_profit) {
            (Some(stop), Some(tp)) => {
                let risk = (price - stop).abs();
                let reward = (tp - price).abs();
                if risk > 0.0 { reward / risk } else { DEFAULT_RR_RATIO }
            }
            _ => DEFAULT_RR_RATIO,
        };

        let stop_loss_pct = if let Some(stop) = request.stop_loss {
            (price - stop).abs() / price
        } else if let Some(atr) = request.atr {
            (atr * ATR_MULTIPLIER) / price
        } else {
            DEFAULT_STOP_PCT
        };

        let win_probability = win_probability(request.confidence);

        let (mut position_size, mut method) = match self.default_method {
            SizingMethod::Kelly => {
                let fraction = kelly_fraction(win_probability, reward_risk_ratio);
                (self.account_balance * fraction, "Kelly Criterion".to_string())
            }
            SizingMethod::Fixed => (
                self.fixed_fractional(stop_loss_pct),
                "Fixed Fractional".to_string(),
            ),
            SizingMethod::Volatility => match request.atr {
                Some(atr) => {
                    let distance_pct = (atr * ATR_MULTIPLIER) / price;
                    (
                        self.fixed_fractional(distance_pct),
                        "Volatility-Based (ATR)".to_string(),
                    )
                }
                None => (
                    self.fixed_fractional(stop_loss_pct),
                    "Fixed Fractional (no ATR)".to_string(),
                ),
            },
            SizingMethod::Hybrid => {
                let fraction = kelly_fraction(win_probability, reward_risk_ratio);
                let kelly_size = self.account_balance * fraction;
                let fixed_size = self.fixed_fractional(stop_loss_pct);
                let conservative = kelly_size.min(fixed_size);
                let max_allowed = self.account_balance * self.max_position_pct;

                // Small-account rule: when the conservative pick is
                // below the adjusted cap, use the cap so orders clear
                // exchange minimums.
                if conservative < max_allowed && max_allowed <= self.account_balance * 0.80 {
                    (max_allowed, "Hybrid (Kelly + Fixed, max-adjusted)".to_string())
                } else {
                    (conservative, "Hybrid (Kelly + Fixed)".to_string())
                }
            }
        };

        // Portfolio-risk headroom: shrink the size so the projected
        // total risk lands exactly on the cap.
        let risk_amount = position_size * stop_loss_pct;
        let projected_risk = request.current_portfolio_risk + risk_amount / self.account_balance;
        if projected_risk > self.max_total_risk && stop_loss_pct > 0.0 {
            let headroom = (self.max_total_risk - request.current_portfolio_risk).max(0.0);
            position_size = headroom * self.account_balance / stop_loss_pct;
            method.push_str(" (risk-adjusted)");
        }

        // Final per-position cap.
        let max_position_size = self.account_balance * self.max_position_pct;
        if position_size > max_position_size {
            position_size = max_position_size;
        }

        let quantity = round_dp(position_size / price, 8);
        let position_size = round_dp(position_size, 2);
        let risk_amount = round_dp(position_size * stop_loss_pct, 2);
        let kelly_fraction = if self.account_balance > 0.0 {
            position_size / self.account_balance
        } else {
            0.0
        };

        let reasoning = format!(
            "Position size: ${:.2} ({:.1}% of portfolio) | Risk: ${:.2} ({:.1}% stop) | R:R {:.2}:1 | Win prob: {:.1}% | Method: {}",
            position_size,
            kelly_fraction * 100.0,
            risk_amount,
            stop_loss_pct * 100.0,
            reward_risk_ratio,
            win_probability * 100.0,
            method
        );

        SizedPosition {
            quantity,
            size_usd: position_size,
            risk_amount,
            kelly_fraction,
            method,
            reasoning,
            win_probability,
            reward_risk_ratio,
            stop_loss_pct,
        }
    }

    fn fixed_fractional(&self, stop_loss_pct: f64) -> f64 {
        if stop_loss_pct <= 0.0 {
            return self.account_balance * self.max_position_pct;
        }
        let risk_amount = self.account_balance * RISK_PER_TRADE;
        let size = risk_amount / stop_loss_pct;
        size.min(self.account_balance * self.max_position_pct)
    }
}

fn round_dp(value: f64, dp: u32) -> f64 {
    let factor = 10f64.powi(dp as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizer(balance: f64) -> PositionSizer {
        PositionSizer::new(balance, 0.20, SizingMethod::Hybrid)
    }

    fn request(price: f64, confidence: f64, stop: f64, tp: f64) -> SizingRequest {
        SizingRequest {
            price,
            confidence,
            stop_loss: Some(stop),
            take_profit: Some(tp),
            atr: None,
            current_portfolio_risk: 0.0,
        }
    }

    #[test]
    fn test_win_probability_mapping() {
        assert!((win_probability(0.6) - 0.53).abs() < 1e-9);
        assert!((win_probability(0.8) - 0.59).abs() < 1e-9);
        // Clamps.
        assert_eq!(win_probability(0.0), 0.51);
        assert_eq!(win_probability(1.0), 0.65);
    }

    #[test]
    fn test_kelly_lower_clamp() {
        // p = 0.51, b = 0.1: raw Kelly is deeply negative.
        assert_eq!(kelly_fraction(0.51, 0.1), KELLY_MIN);
    }

    #[test]
    fn test_kelly_upper_clamp() {
        // p = 0.70, b = 3.0: raw Kelly is 0.6, clamped to 0.25.
        assert_eq!(kelly_fraction(0.70, 3.0), KELLY_MAX);
    }

    #[test]
    fn test_kelly_half_below_even_odds() {
        // p < 0.5 halves the clamped fraction.
        let fraction = kelly_fraction(0.4, 2.0);
        assert!((fraction - KELLY_MIN * 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_kelly_degenerate_inputs() {
        assert_eq!(kelly_fraction(0.0, 2.0), KELLY_MIN);
        assert_eq!(kelly_fraction(1.0, 2.0), KELLY_MIN);
        assert_eq!(kelly_fraction(0.6, 0.0), KELLY_MIN);
    }

    #[test]
    fn test_small_account_position_cap_schedule() {
        assert_eq!(PositionSizer::new(50.0, 0.2, SizingMethod::Hybrid).max_position_pct, 0.80);
        assert_eq!(PositionSizer::new(500.0, 0.2, SizingMethod::Hybrid).max_position_pct, 0.30);
        assert_eq!(PositionSizer::new(10000.0, 0.2, SizingMethod::Hybrid).max_position_pct, 0.10);
    }

    #[test]
    fn test_hybrid_uses_cap_for_conservative_picks() {
        let sizer = sizer(10000.0);
        // Stops 4% out, rr 2: Kelly and fixed both land above the 10%
        // cap or below it; the hybrid result never exceeds the cap.
        let sized = sizer.size(&request(50000.0, 0.75, 48000.0, 54000.0));
        assert!(sized.size_usd <= 10000.0 * 0.10 + 1e-9);
        assert!(sized.method.starts_with("Hybrid"));
        assert!(sized.quantity > 0.0);
    }

    #[test]
    fn test_fixed_fractional_formula() {
        let sizer = PositionSizer::new(10000.0, 0.2, SizingMethod::Fixed);
        // risk 2% = $200, stop 5% => $4000, capped at 10% = $1000.
        let sized = sizer.size(&SizingRequest {
            price: 100.0,
            confidence: 0.7,
            stop_loss: Some(95.0),
            take_profit: Some(110.0),
            atr: None,
            current_portfolio_risk: 0.0,
        });
        assert_eq!(sized.size_usd, 1000.0);
        assert_eq!(sized.quantity, 10.0);
    }

    #[test]
    fn test_portfolio_risk_headroom_shrinks_size() {
        // Existing risk 0.18, cap 0.20: only 0.02 of headroom. Kelly
        // at full clamp with a 25% stop would add 0.0625 of risk; the
        // shrink lands the size exactly on the remaining headroom.
        let sizer = PositionSizer::new(10000.0, 0.20, SizingMethod::Kelly);
        let sized = sizer.size(&SizingRequest {
            price: 100.0,
            confidence: 0.9,
            stop_loss: Some(75.0),
            take_profit: Some(150.0),
            atr: None,
            current_portfolio_risk: 0.18,
        });
        assert!(sized.method.ends_with("(risk-adjusted)"));
        assert!((sized.size_usd - 0.02 * 10000.0 / 0.25).abs() < 1e-6);
        // Consuming exactly the headroom lands the portfolio on the
        // cap, not over it.
        let projected = 0.18 + sized.risk_amount / 10000.0;
        assert!((projected - 0.20).abs() < 1e-9);
    }

    #[test]
    fn test_volatility_sizing_uses_atr_distance() {
        let sizer = PositionSizer::new(10000.0, 0.2, SizingMethod::Volatility);
        let sized = sizer.size(&SizingRequest {
            price: 50000.0,
            confidence: 0.7,
            stop_loss: None,
            take_profit: None,
            atr: Some(1000.0),
            current_portfolio_risk: 0.0,
        });
        // Stop distance 2*ATR = 4% of price; $200 risk / 0.04 = $5000,
        // capped at $1000.
        assert_eq!(sized.size_usd, 1000.0);
        assert_eq!(sized.method, "Volatility-Based (ATR)");
    }

    #[test]
    fn test_outputs_carry_quantity_and_reasoning() {
        let sized = sizer(10000.0).size(&request(50000.0, 0.8, 48000.0, 54000.0));
        assert!((sized.quantity - sized.size_usd / 50000.0).abs() < 1e-6);
        assert!(sized.reasoning.contains("Method:"));
        assert!(sized.risk_amount > 0.0);
    }
}
