//! Fusion policies: combine per-agent signals into one direction and
//! confidence.
//!
//! Fusion is pure and deterministic: policies see pre-computed signal
//! ages, never the clock, so the same inputs always fuse to the same
//! decision. Ties break toward HOLD.

use crate::domain::types::SignalKind;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::str::FromStr;

/// Score a direction must strictly exceed before the weighted
/// policies act on it.
const DIRECTION_THRESHOLD: f64 = 0.30;

/// One signal as seen by a fusion policy.
#[derive(Debug, Clone)]
pub struct FusionInput {
    pub agent_type: String,
    pub kind: SignalKind,
    pub confidence: f64,
    /// Age of the signal at decision time, in minutes.
    pub age_minutes: f64,
    pub reasoning: String,
}

/// Outcome of one fusion pass.
#[derive(Debug, Clone)]
pub struct FusedDecision {
    pub signal: SignalKind,
    pub confidence: f64,
    pub buy_score: f64,
    pub sell_score: f64,
    pub reasoning: Vec<String>,
    /// Policy-specific diagnostics, persisted as `fusion_details`.
    pub details: Map<String, Value>,
}

impl FusedDecision {
    fn hold(reason: &str) -> Self {
        Self {
            signal: SignalKind::Hold,
            confidence: 0.0,
            buy_score: 0.0,
            sell_score: 0.0,
            reasoning: vec![reason.to_string()],
            details: Map::new(),
        }
    }
}

/// Which policy the fusion worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionStrategy {
    Bayesian,
    Consensus,
    TimeDecay,
    Hybrid,
}

impl FusionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FusionStrategy::Bayesian => "bayesian",
            FusionStrategy::Consensus => "consensus",
            FusionStrategy::TimeDecay => "time_decay",
            FusionStrategy::Hybrid => "hybrid",
        }
    }
}

impl FromStr for FusionStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bayesian" => Ok(FusionStrategy::Bayesian),
            "consensus" => Ok(FusionStrategy::Consensus),
            "time_decay" => Ok(FusionStrategy::TimeDecay),
            "hybrid" => Ok(FusionStrategy::Hybrid),
            _ => anyhow::bail!(
                "Unknown fusion strategy: {}. Must be bayesian, consensus, time_decay or hybrid",
                s
            ),
        }
    }
}

fn describe(signals: &[FusionInput]) -> Vec<String> {
    signals
        .iter()
        .map(|s| {
            format!(
                "{}: {} ({:.0}%) - {}",
                s.agent_type,
                s.kind,
                s.confidence * 100.0,
                s.reasoning
            )
        })
        .collect()
}

/// Pick a direction from normalized buy/sell scores. The winning
/// score must be strictly larger than the opposing one and above the
/// action threshold; anything else is HOLD with the larger score as
/// confidence.
fn direction_from_scores(buy_score: f64, sell_score: f64) -> (SignalKind, f64) {
    if buy_score > sell_score && buy_score > DIRECTION_THRESHOLD {
        (SignalKind::Buy, buy_score)
    } else if sell_score > buy_score && sell_score > DIRECTION_THRESHOLD {
        (SignalKind::Sell, sell_score)
    } else {
        (SignalKind::Hold, buy_score.max(sell_score))
    }
}

/// Argmax over the three per-direction vote sums. A direction wins
/// only by strictly beating both rivals; any exact tie, BUY against
/// SELL included, falls back to HOLD with the top score.
fn hybrid_direction(buy_total: f64, sell_total: f64, hold_total: f64) -> (SignalKind, f64) {
    if buy_total > sell_total && buy_total > hold_total {
        (SignalKind::Buy, buy_total)
    } else if sell_total > buy_total && sell_total > hold_total {
        (SignalKind::Sell, sell_total)
    } else {
        (SignalKind::Hold, hold_total.max(buy_total).max(sell_total))
    }
}

/// Weighted-posterior fusion: each agent class is weighted by its
/// historically observed accuracy (recent observations count more)
/// times the confidence of the signal at hand.
pub struct BayesianFusion {
    history_window: usize,
    performance: HashMap<String, VecDeque<f64>>,
}

impl BayesianFusion {
    pub fn new(history_window: usize) -> Self {
        Self {
            history_window,
            performance: HashMap::new(),
        }
    }

    /// Record an observed accuracy for an agent class, keeping a
    /// bounded history.
    pub fn update_performance(&mut self, agent_type: &str, accuracy: f64) {
        let history = self.performance.entry(agent_type.to_string()).or_default();
        history.push_back(accuracy.clamp(0.0, 1.0));
        while history.len() > self.history_window {
            history.pop_front();
        }
    }

    /// Exponentially decayed weighted mean of the accuracy history;
    /// 0.5 neutral prior for unknown agents.
    pub fn agent_weight(&self, agent_type: &str) -> f64 {
        let history = match self.performance.get(agent_type) {
            Some(h) if !h.is_empty() => h,
            _ => return 0.5,
        };

        let n = history.len();
        let mut weight_sum = 0.0;
        let mut weighted = 0.0;
        for (i, accuracy) in history.iter().enumerate() {
            // Older entries decay toward e^-1 of the newest.
            let exponent = if n == 1 {
                0.0
            } else {
                -1.0 + (i as f64) / ((n - 1) as f64)
            };
            let w = exponent.exp();
            weight_sum += w;
            weighted += w * accuracy;
        }
        weighted / weight_sum
    }

    pub fn fuse(&self, signals: &[FusionInput]) -> FusedDecision {
        if signals.is_empty() {
            return FusedDecision::hold("No signals available");
        }

        // BTreeMap keeps the normalization sum order stable so fusion
        // stays bit-identical for fixed inputs.
        let mut agent_weights: BTreeMap<&str, f64> = BTreeMap::new();
        for signal in signals {
            let base = self.agent_weight(&signal.agent_type);
            agent_weights.insert(signal.agent_type.as_str(), base * signal.confidence);
        }

        let total: f64 = agent_weights.values().sum();
        if total > 0.0 {
            for weight in agent_weights.values_mut() {
                *weight /= total;
            }
        }

        let mut buy_score = 0.0;
        let mut sell_score = 0.0;
        for signal in signals {
            let weight = agent_weights
                .get(signal.agent_type.as_str())
                .copied()
                .unwrap_or(0.0);
            match signal.kind {
                SignalKind::Buy => buy_score += weight,
                SignalKind::Sell => sell_score += weight,
                SignalKind::Hold => {}
            }
        }

        let (direction, confidence) = direction_from_scores(buy_score, sell_score);

        let mut details = Map::new();
        details.insert(
            "weights".to_string(),
            json!(
                agent_weights
                    .iter()
                    .map(|(k, v)| (k.to_string(), *v))
                    .collect::<BTreeMap<String, f64>>()
            ),
        );
        details.insert("buy_score".to_string(), json!(buy_score));
        details.insert("sell_score".to_string(), json!(sell_score));

        FusedDecision {
            signal: direction,
            confidence,
            buy_score,
            sell_score,
            reasoning: describe(signals),
            details,
        }
    }
}

/// Consensus fusion: only strong signals vote, and a direction needs
/// a supermajority of them.
pub struct ConsensusFusion {
    pub min_confidence: f64,
    pub min_agreement: f64,
}

impl ConsensusFusion {
    pub fn new(min_confidence: f64, min_agreement: f64) -> Self {
        Self {
            min_confidence,
            min_agreement,
        }
    }

    pub fn fuse(&self, signals: &[FusionInput]) -> FusedDecision {
        if signals.is_empty() {
            return FusedDecision::hold("No signals");
        }

        let strong: Vec<&FusionInput> = signals
            .iter()
            .filter(|s| s.confidence >= self.min_confidence)
            .collect();

        if strong.is_empty() {
            return FusedDecision::hold("No strong signals");
        }

        let total = strong.len() as f64;
        let buyers: Vec<&&FusionInput> =
            strong.iter().filter(|s| s.kind == SignalKind::Buy).collect();
        let sellers: Vec<&&FusionInput> = strong
            .iter()
            .filter(|s| s.kind == SignalKind::Sell)
            .collect();

        let buy_agreement = buyers.len() as f64 / total;
        let sell_agreement = sellers.len() as f64 / total;

        let mut details = Map::new();
        if buy_agreement >= self.min_agreement {
            let confidence =
                buyers.iter().map(|s| s.confidence).sum::<f64>() / buyers.len() as f64;
            details.insert("agreement".to_string(), json!(buy_agreement));
            FusedDecision {
                signal: SignalKind::Buy,
                confidence,
                buy_score: buy_agreement,
                sell_score: sell_agreement,
                reasoning: buyers.iter().map(|s| s.reasoning.clone()).collect(),
                details,
            }
        } else if sell_agreement >= self.min_agreement {
            let confidence =
                sellers.iter().map(|s| s.confidence).sum::<f64>() / sellers.len() as f64;
            details.insert("agreement".to_string(), json!(sell_agreement));
            FusedDecision {
                signal: SignalKind::Sell,
                confidence,
                buy_score: buy_agreement,
                sell_score: sell_agreement,
                reasoning: sellers.iter().map(|s| s.reasoning.clone()).collect(),
                details,
            }
        } else {
            FusedDecision::hold("No consensus reached")
        }
    }
}

/// Time-decay fusion: a signal's vote halves every `half_life`
/// minutes of age.
pub struct TimeDecayFusion {
    pub half_life_minutes: f64,
}

impl TimeDecayFusion {
    pub fn new(half_life_minutes: f64) -> Self {
        Self { half_life_minutes }
    }

    pub fn time_weight(&self, age_minutes: f64) -> f64 {
        0.5_f64.powf(age_minutes / self.half_life_minutes)
    }

    pub fn fuse(&self, signals: &[FusionInput]) -> FusedDecision {
        if signals.is_empty() {
            return FusedDecision::hold("No signals");
        }

        let mut buy_score = 0.0;
        let mut sell_score = 0.0;
        let mut total_weight = 0.0;

        for signal in signals {
            let weight = self.time_weight(signal.age_minutes) * signal.confidence;
            total_weight += weight;
            match signal.kind {
                SignalKind::Buy => buy_score += weight,
                SignalKind::Sell => sell_score += weight,
                SignalKind::Hold => {}
            }
        }

        if total_weight > 0.0 {
            buy_score /= total_weight;
            sell_score /= total_weight;
        }

        let (direction, confidence) = direction_from_scores(buy_score, sell_score);

        let mut details = Map::new();
        details.insert("buy_score".to_string(), json!(buy_score));
        details.insert("sell_score".to_string(), json!(sell_score));
        details.insert("half_life_minutes".to_string(), json!(self.half_life_minutes));

        FusedDecision {
            signal: direction,
            confidence,
            buy_score,
            sell_score,
            reasoning: describe(signals),
            details,
        }
    }
}

/// Hybrid fusion: run all three policies on the same signals, sum the
/// per-direction confidences, and take the argmax (HOLD on ties).
pub struct HybridFusion {
    pub bayesian: BayesianFusion,
    pub consensus: ConsensusFusion,
    pub time_decay: TimeDecayFusion,
}

impl HybridFusion {
    pub fn new() -> Self {
        Self {
            bayesian: BayesianFusion::new(100),
            consensus: ConsensusFusion::new(0.6, 0.6),
            time_decay: TimeDecayFusion::new(30.0),
        }
    }

    pub fn fuse(&self, signals: &[FusionInput]) -> FusedDecision {
        if signals.is_empty() {
            return FusedDecision::hold("No signals");
        }

        let bayesian = self.bayesian.fuse(signals);
        let consensus = self.consensus.fuse(signals);
        let time_decay = self.time_decay.fuse(signals);

        let votes = [
            (bayesian.signal, bayesian.confidence),
            (consensus.signal, consensus.confidence),
            (time_decay.signal, time_decay.confidence),
        ];

        let mut buy_total = 0.0;
        let mut sell_total = 0.0;
        let mut hold_total = 0.0;
        for (kind, confidence) in votes {
            match kind {
                SignalKind::Buy => buy_total += confidence,
                SignalKind::Sell => sell_total += confidence,
                SignalKind::Hold => hold_total += confidence,
            }
        }

        let (best, best_score) = hybrid_direction(buy_total, sell_total, hold_total);

        let mut details = Map::new();
        details.insert(
            "strategies".to_string(),
            json!({
                "bayesian": { "signal": bayesian.signal.to_string(), "confidence": bayesian.confidence },
                "consensus": { "signal": consensus.signal.to_string(), "confidence": consensus.confidence },
                "time_decay": { "signal": time_decay.signal.to_string(), "confidence": time_decay.confidence },
            }),
        );

        FusedDecision {
            signal: best,
            confidence: best_score / 3.0,
            buy_score: buy_total / 3.0,
            sell_score: sell_total / 3.0,
            reasoning: bayesian.reasoning,
            details,
        }
    }
}

impl Default for HybridFusion {
    fn default() -> Self {
        Self::new()
    }
}

/// All policies behind one dispatch point, owned by the fusion
/// worker.
pub struct FusionEngine {
    strategy: FusionStrategy,
    pub bayesian: BayesianFusion,
    pub consensus: ConsensusFusion,
    pub time_decay: TimeDecayFusion,
    pub hybrid: HybridFusion,
}

impl FusionEngine {
    pub fn new(strategy: FusionStrategy) -> Self {
        Self {
            strategy,
            bayesian: BayesianFusion::new(100),
            consensus: ConsensusFusion::new(0.6, 0.6),
            time_decay: TimeDecayFusion::new(30.0),
            hybrid: HybridFusion::new(),
        }
    }

    pub fn strategy(&self) -> FusionStrategy {
        self.strategy
    }

    pub fn fuse(&self, signals: &[FusionInput]) -> FusedDecision {
        match self.strategy {
            FusionStrategy::Bayesian => self.bayesian.fuse(signals),
            FusionStrategy::Consensus => self.consensus.fuse(signals),
            FusionStrategy::TimeDecay => self.time_decay.fuse(signals),
            FusionStrategy::Hybrid => self.hybrid.fuse(signals),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(agent: &str, kind: SignalKind, confidence: f64, age_minutes: f64) -> FusionInput {
        FusionInput {
            agent_type: agent.to_string(),
            kind,
            confidence,
            age_minutes,
            reasoning: "test".to_string(),
        }
    }

    #[test]
    fn test_bayesian_agreeing_buys() {
        let fusion = BayesianFusion::new(100);
        let signals = vec![
            input("technical", SignalKind::Buy, 0.8, 1.0),
            input("sentiment", SignalKind::Buy, 0.7, 2.0),
        ];
        let decision = fusion.fuse(&signals);
        assert_eq!(decision.signal, SignalKind::Buy);
        // All the normalized weight votes BUY.
        assert!((decision.confidence - 1.0).abs() < 1e-9);
        assert_eq!(decision.sell_score, 0.0);
    }

    #[test]
    fn test_bayesian_below_threshold_holds() {
        let fusion = BayesianFusion::new(100);
        // One weak buy among holds: normalized buy weight stays under
        // the 0.30 action threshold only if others hold the weight.
        let signals = vec![
            input("technical", SignalKind::Hold, 0.9, 1.0),
            input("sentiment", SignalKind::Hold, 0.9, 1.0),
            input("fundamental", SignalKind::Buy, 0.3, 1.0),
        ];
        let decision = fusion.fuse(&signals);
        assert_eq!(decision.signal, SignalKind::Hold);
    }

    #[test]
    fn test_bayesian_weight_history_bounded() {
        let mut fusion = BayesianFusion::new(5);
        for _ in 0..50 {
            fusion.update_performance("technical", 1.0);
        }
        assert_eq!(fusion.performance.get("technical").unwrap().len(), 5);
    }

    #[test]
    fn test_bayesian_weight_neutral_prior() {
        let fusion = BayesianFusion::new(100);
        assert_eq!(fusion.agent_weight("unseen"), 0.5);
    }

    #[test]
    fn test_bayesian_recent_accuracy_dominates() {
        let mut fusion = BayesianFusion::new(100);
        fusion.update_performance("technical", 0.2);
        fusion.update_performance("technical", 0.9);
        let weight = fusion.agent_weight("technical");
        // Newer observation carries more of the decayed mean.
        assert!(weight > 0.55, "weight {} should lean toward 0.9", weight);
    }

    #[test]
    fn test_consensus_requires_strong_signals() {
        let fusion = ConsensusFusion::new(0.6, 0.6);
        let signals = vec![
            input("technical", SignalKind::Buy, 0.55, 1.0),
            input("sentiment", SignalKind::Buy, 0.58, 1.0),
        ];
        let decision = fusion.fuse(&signals);
        assert_eq!(decision.signal, SignalKind::Hold);
        assert_eq!(decision.confidence, 0.0);
    }

    #[test]
    fn test_consensus_supermajority_buy() {
        let fusion = ConsensusFusion::new(0.6, 0.6);
        let signals = vec![
            input("technical", SignalKind::Buy, 0.8, 1.0),
            input("sentiment", SignalKind::Buy, 0.7, 1.0),
            input("fundamental", SignalKind::Sell, 0.9, 1.0),
        ];
        let decision = fusion.fuse(&signals);
        assert_eq!(decision.signal, SignalKind::Buy);
        // Mean confidence of the agreeing signals only.
        assert!((decision.confidence - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_consensus_split_holds() {
        let fusion = ConsensusFusion::new(0.6, 0.6);
        let signals = vec![
            input("technical", SignalKind::Buy, 0.8, 1.0),
            input("sentiment", SignalKind::Sell, 0.8, 1.0),
        ];
        assert_eq!(fusion.fuse(&signals).signal, SignalKind::Hold);
    }

    #[test]
    fn test_time_decay_half_life() {
        let fusion = TimeDecayFusion::new(30.0);
        assert!((fusion.time_weight(0.0) - 1.0).abs() < 1e-12);
        assert!((fusion.time_weight(30.0) - 0.5).abs() < 1e-12);
        assert!((fusion.time_weight(60.0) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_time_decay_fresh_signal_wins() {
        let fusion = TimeDecayFusion::new(30.0);
        let signals = vec![
            input("technical", SignalKind::Sell, 0.8, 120.0),
            input("sentiment", SignalKind::Buy, 0.8, 0.0),
        ];
        let decision = fusion.fuse(&signals);
        assert_eq!(decision.signal, SignalKind::Buy);
        assert!(decision.buy_score > decision.sell_score);
    }

    #[test]
    fn test_hybrid_two_strong_buys() {
        let fusion = HybridFusion::new();
        let signals = vec![
            input("technical", SignalKind::Buy, 0.8, 1.0),
            input("sentiment", SignalKind::Buy, 0.7, 2.0),
        ];
        let decision = fusion.fuse(&signals);
        assert_eq!(decision.signal, SignalKind::Buy);
        // Bayesian 1.0 + consensus 0.75 + time-decay 1.0, averaged.
        assert!(decision.confidence >= 0.6);
    }

    #[test]
    fn test_hybrid_conflicting_weak_signals_suppressed() {
        let fusion = HybridFusion::new();
        let signals = vec![
            input("technical", SignalKind::Buy, 0.55, 1.0),
            input("sentiment", SignalKind::Sell, 0.58, 1.0),
        ];
        let decision = fusion.fuse(&signals);
        // Consensus abstains; the weighted policies lean SELL but the
        // averaged confidence stays far below any actionable level.
        assert!(decision.confidence < 0.6);
    }

    #[test]
    fn test_hybrid_tie_prefers_hold() {
        // No signals at all.
        assert_eq!(HybridFusion::new().fuse(&[]).signal, SignalKind::Hold);

        // A dead heat between BUY and SELL votes never picks a side.
        let (kind, score) = hybrid_direction(0.8, 0.8, 0.1);
        assert_eq!(kind, SignalKind::Hold);
        assert!((score - 0.8).abs() < 1e-12);

        // Tying with HOLD itself is not a win either.
        assert_eq!(hybrid_direction(0.5, 0.2, 0.5).0, SignalKind::Hold);
        assert_eq!(hybrid_direction(0.2, 0.5, 0.5).0, SignalKind::Hold);

        // Strict winners still get through.
        assert_eq!(hybrid_direction(0.9, 0.3, 0.2).0, SignalKind::Buy);
        assert_eq!(hybrid_direction(0.1, 0.6, 0.2).0, SignalKind::Sell);
    }

    #[test]
    fn test_hybrid_symmetric_conflict_holds() {
        // Equal-strength opposing signals of the same age: each
        // sub-policy deadlocks internally and the fused vote is HOLD.
        let fusion = HybridFusion::new();
        let signals = vec![
            input("technical", SignalKind::Buy, 0.55, 0.0),
            input("sentiment", SignalKind::Sell, 0.55, 0.0),
        ];
        let decision = fusion.fuse(&signals);
        assert_eq!(decision.signal, SignalKind::Hold);
        assert_eq!(decision.buy_score, 0.0);
        assert_eq!(decision.sell_score, 0.0);
    }

    #[test]
    fn test_fusion_is_deterministic() {
        let fusion = HybridFusion::new();
        let signals = vec![
            input("technical", SignalKind::Buy, 0.8, 3.0),
            input("sentiment", SignalKind::Sell, 0.65, 7.0),
            input("fundamental", SignalKind::Buy, 0.72, 1.0),
        ];
        let first = fusion.fuse(&signals);
        for _ in 0..10 {
            let again = fusion.fuse(&signals);
            assert_eq!(again.signal, first.signal);
            assert_eq!(again.confidence.to_bits(), first.confidence.to_bits());
            assert_eq!(again.buy_score.to_bits(), first.buy_score.to_bits());
            assert_eq!(again.sell_score.to_bits(), first.sell_score.to_bits());
        }
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            "hybrid".parse::<FusionStrategy>().unwrap(),
            FusionStrategy::Hybrid
        );
        assert_eq!(
            "time_decay".parse::<FusionStrategy>().unwrap(),
            FusionStrategy::TimeDecay
        );
        assert!("oracle".parse::<FusionStrategy>().is_err());
    }
}
