//! Trade validation: five independent checks, each adding to an
//! additive risk score. A trade is approved only when every check
//! passes.

use crate::domain::types::base_asset;
use serde_json::{Map, Value, json};

/// One-sided z multiplier for the 95% normal quantile, used for the
/// VaR contribution estimate.
const VAR_Z_95: f64 = 1.65;

/// Open position as the validator sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioPosition {
    pub symbol: String,
    pub size_usd: f64,
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
}

impl PortfolioPosition {
    /// Fraction of the position value at risk between entry and stop.
    /// Positions without a stop are assumed 5% at risk.
    pub fn risk_pct(&self) -> f64 {
        match self.stop_loss {
            Some(stop) if self.entry_price > 0.0 => {
                (self.entry_price - stop).abs() / self.entry_price
            }
            _ => 0.05,
        }
    }
}

/// Sum over open positions of `size * |entry - stop| / entry`,
/// divided by the account balance.
pub fn portfolio_risk(positions: &[PortfolioPosition], account_balance: f64) -> f64 {
    if account_balance <= 0.0 {
        return 0.0;
    }
    let total: f64 = positions.iter().map(|p| p.size_usd * p.risk_pct()).sum();
    total / account_balance
}

/// Verdict for one proposed trade.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeAssessment {
    pub symbol: String,
    pub approved: bool,
    pub risk_score: f64,
    pub position_size: f64,
    pub max_loss: f64,
    pub var_contribution: f64,
    pub portfolio_risk_after: f64,
    pub rejection_reason: Option<String>,
    pub metrics: Map<String, Value>,
}

/// Inputs for one validation run.
#[derive(Debug, Clone)]
pub struct ValidationRequest<'a> {
    pub symbol: &'a str,
    pub confidence: f64,
    pub position_size: f64,
    pub risk_amount: f64,
    pub reward_risk_ratio: f64,
    pub current_portfolio_risk: f64,
    pub account_balance: f64,
    pub open_positions: &'a [PortfolioPosition],
}

#[derive(Debug, Clone)]
pub struct TradeValidator {
    pub max_portfolio_risk: f64,
    pub max_single_trade_risk: f64,
    pub min_reward_risk_ratio: f64,
    pub min_confidence: f64,
    pub max_correlation_risk: f64,
}

impl TradeValidator {
    pub fn new(
        max_portfolio_risk: f64,
        max_single_trade_risk: f64,
        min_reward_risk_ratio: f64,
        min_confidence: f64,
    ) -> Self {
        Self {
            max_portfolio_risk,
            max_single_trade_risk,
            min_reward_risk_ratio,
            min_confidence,
            max_correlation_risk: 0.30,
        }
    }

    pub fn validate(&self, request: &ValidationRequest<'_>) -> TradeAssessment {
        let mut rejections: Vec<String> = Vec::new();
        let mut risk_score: f64 = 0.0;

        if request.confidence < self.min_confidence {
            rejections.push(format!(
                "Low confidence: {:.1}% < {:.1}%",
                request.confidence * 100.0,
                self.min_confidence * 100.0
            ));
            risk_score += 0.3;
        }

        if request.reward_risk_ratio < self.min_reward_risk_ratio {
            rejections.push(format!(
                "Poor R/R: {:.2} < {:.2}",
                request.reward_risk_ratio, self.min_reward_risk_ratio
            ));
            risk_score += 0.2;
        }

        let trade_risk_pct = if request.account_balance > 0.0 {
            request.risk_amount / request.account_balance
        } else {
            1.0
        };
        if trade_risk_pct > self.max_single_trade_risk {
            rejections.push(format!(
                "Excessive trade risk: {:.1}% > {:.1}%",
                trade_risk_pct * 100.0,
                self.max_single_trade_risk * 100.0
            ));
            risk_score += 0.3;
        }

        let portfolio_risk_after = request.current_portfolio_risk + trade_risk_pct;
        if portfolio_risk_after > self.max_portfolio_risk {
            rejections.push(format!(
                "Portfolio risk limit: {:.1}% > {:.1}%",
                portfolio_risk_after * 100.0,
                self.max_portfolio_risk * 100.0
            ));
            risk_score += 0.4;
        }

        // Correlated exposure: positions sharing the base asset move
        // together for this purpose.
        if !request.open_positions.is_empty() && request.account_balance > 0.0 {
            let base = base_asset(request.symbol);
            let correlated: f64 = request
                .open_positions
                .iter()
                .filter(|p| base_asset(&p.symbol) == base)
                .map(|p| p.size_usd)
                .sum();
            let correlation_pct = correlated / request.account_balance;
            if correlation_pct > self.max_correlation_risk {
                rejections.push(format!(
                    "High correlation exposure: {:.1}%",
                    correlation_pct * 100.0
                ));
                risk_score += 0.2;
            }
        }

        let risk_score = risk_score.min(1.0);
        let approved = rejections.is_empty();
        let rejection_reason = if approved {
            None
        } else {
            Some(rejections.join("; "))
        };

        // Normal approximation at 95%.
        let var_contribution = request.risk_amount * VAR_Z_95;

        let mut metrics = Map::new();
        metrics.insert("confidence".to_string(), json!(request.confidence));
        metrics.insert(
            "reward_risk_ratio".to_string(),
            json!(request.reward_risk_ratio),
        );
        metrics.insert("trade_risk_pct".to_string(), json!(trade_risk_pct));
        metrics.insert(
            "current_portfolio_risk".to_string(),
            json!(request.current_portfolio_risk),
        );
        metrics.insert(
            "portfolio_risk_after".to_string(),
            json!(portfolio_risk_after),
        );

        TradeAssessment {
            symbol: request.symbol.to_string(),
            approved,
            risk_score,
            position_size: request.position_size,
            max_loss: request.risk_amount,
            var_contribution,
            portfolio_risk_after,
            rejection_reason,
            metrics,
        }
    }
}
