use crate::config::FusionConfig;
use crate::domain::messages::{Envelope, Payload, TradeIntent, TradingSignal};
use crate::domain::ports::MessageBus;
use crate::domain::repositories::{
    DecisionRepository, SignalRepository, SignalRow, WorkerConfigRepository,
};
use crate::domain::types::SignalKind;
use crate::fusion::buffer::{BufferedSignal, SignalBuffer};
use crate::fusion::policy::{FusedDecision, FusionEngine, FusionInput};
use crate::runtime::{Worker, publish};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const TOPIC_INTENT: &str = "trade.intent";
const INTENT_PRIORITY: u8 = 8;

/// Signal Fusion worker: buffers signals per symbol and periodically
/// fuses them into trade intents.
pub struct FusionWorker {
    name: String,
    config: FusionConfig,
    bus: Arc<dyn MessageBus>,
    decisions: Arc<dyn DecisionRepository>,
    signals: Arc<dyn SignalRepository>,
    engine: FusionEngine,
    buffers: HashMap<String, SignalBuffer>,
    config_store: Option<Arc<dyn WorkerConfigRepository>>,
}

impl FusionWorker {
    pub fn new(
        name: impl Into<String>,
        config: FusionConfig,
        bus: Arc<dyn MessageBus>,
        decisions: Arc<dyn DecisionRepository>,
        signals: Arc<dyn SignalRepository>,
    ) -> Self {
        let engine = FusionEngine::new(config.fusion_strategy);
        Self {
            name: name.into(),
            config,
            bus,
            decisions,
            signals,
            engine,
            buffers: HashMap::new(),
            config_store: None,
        }
    }

    pub fn with_config_store(mut self, store: Arc<dyn WorkerConfigRepository>) -> Self {
        self.config_store = Some(store);
        self
    }

    /// Apply the recognized persisted options over the static config.
    fn apply_config(&mut self, config: &Value) -> Result<()> {
        if let Some(strategy) = config.get("fusion_strategy").and_then(Value::as_str) {
            self.config.fusion_strategy = strategy.parse()?;
            self.engine = FusionEngine::new(self.config.fusion_strategy);
        }
        if let Some(min_signals) = config.get("min_signals").and_then(Value::as_u64) {
            self.config.min_signals = min_signals as usize;
        }
        if let Some(timeout) = config.get("signal_timeout_seconds").and_then(Value::as_u64) {
            self.config.signal_timeout = Duration::from_secs(timeout);
        }
        if let Some(confidence) = config.get("min_confidence").and_then(Value::as_f64) {
            if !(0.0..=1.0).contains(&confidence) {
                anyhow::bail!("min_confidence out of range: {}", confidence);
            }
            self.config.min_confidence = confidence;
        }
        if let Some(interval) = config
            .get("decision_interval_seconds")
            .and_then(Value::as_u64)
        {
            self.config.decision_interval = Duration::from_secs(interval);
        }
        Ok(())
    }

    /// Admit a signal into its symbol buffer. No decision is taken on
    /// arrival.
    pub async fn admit_signal(&mut self, envelope: &Envelope, signal: TradingSignal) {
        let symbol = signal.symbol.clone();

        let row = SignalRow {
            agent_type: signal.agent_type.clone(),
            agent_name: envelope.source_worker.clone(),
            symbol: symbol.clone(),
            signal_type: signal.signal.to_string(),
            confidence: signal.confidence,
            price_target: signal.price_target,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            reasoning: signal.reasoning.clone(),
            indicators: Value::Object(signal.indicators.clone()),
            metadata: Value::Object(envelope.metadata.clone()),
        };
        // Telemetry write; the buffered copy is authoritative.
        if let Err(e) = self.signals.save(&row).await {
            warn!(symbol = %symbol, error = %e, "Failed to persist signal");
        }

        let buffer = self.buffers.entry(symbol.clone()).or_default();
        buffer.push(BufferedSignal {
            signal,
            timestamp: envelope.timestamp,
            source_worker: envelope.source_worker.clone(),
            correlation_id: envelope.correlation_id.clone(),
        });

        debug!(
            symbol = %symbol,
            buffered = buffer.signals.len(),
            pending = buffer.pending_count,
            "Signal buffered"
        );
    }

    /// One decision pass over every symbol with enough pending
    /// signals, followed by the janitor.
    pub async fn decision_pass(&mut self, now: DateTime<Utc>) -> Result<()> {
        let due: Vec<String> = self
            .buffers
            .iter()
            .filter(|(_, b)| b.pending_count >= self.config.min_signals)
            .map(|(symbol, _)| symbol.clone())
            .collect();

        for symbol in due {
            self.decide_symbol(&symbol, now).await;
            if let Some(buffer) = self.buffers.get_mut(&symbol) {
                buffer.pending_count = 0;
            }
        }

        self.janitor(now);
        Ok(())
    }

    async fn decide_symbol(&mut self, symbol: &str, now: DateTime<Utc>) {
        let (inputs, contributing) = match self.buffers.get(symbol) {
            Some(buffer) => {
                let recent = buffer.recent(now, self.config.signal_timeout);
                if recent.len() < self.config.min_signals {
                    debug!(
                        symbol = %symbol,
                        available = recent.len(),
                        required = self.config.min_signals,
                        "Insufficient fresh signals, skipping decision"
                    );
                    return;
                }
                let inputs: Vec<FusionInput> = recent
                    .iter()
                    .map(|s| FusionInput {
                        agent_type: s.signal.agent_type.clone(),
                        kind: s.signal.signal,
                        confidence: s.signal.confidence,
                        age_minutes: s.age_at(now).num_milliseconds() as f64 / 60_000.0,
                        reasoning: s.signal.reasoning.clone().unwrap_or_default(),
                    })
                    .collect();
                let contributing: Vec<TradingSignal> =
                    recent.iter().map(|s| s.signal.clone()).collect();
                (inputs, contributing)
            }
            None => return,
        };

        let decision = self.engine.fuse(&inputs);

        // Sub-threshold and HOLD decisions produce a log line, never
        // an intent. The confidence gate is inclusive.
        if decision.confidence < self.config.min_confidence {
            info!(
                symbol = %symbol,
                signal = %decision.signal,
                confidence = decision.confidence,
                threshold = self.config.min_confidence,
                "Low-confidence decision, no intent"
            );
            return;
        }
        if decision.signal == SignalKind::Hold {
            info!(symbol = %symbol, confidence = decision.confidence, "HOLD decision, no intent");
            return;
        }

        if let Err(e) = self.emit_intent(symbol, &contributing, &decision, now).await {
            warn!(symbol = %symbol, error = %e, "Failed to publish trade intent");
            return;
        }

        if let Some(buffer) = self.buffers.get_mut(symbol) {
            buffer.last_decision = Some(now);
        }

        info!(
            symbol = %symbol,
            signal = %decision.signal,
            confidence = decision.confidence,
            num_signals = contributing.len(),
            strategy = self.engine.strategy().as_str(),
            "Decision made"
        );
    }

    async fn emit_intent(
        &self,
        symbol: &str,
        contributing: &[TradingSignal],
        decision: &FusedDecision,
        _now: DateTime<Utc>,
    ) -> Result<()> {
        let side = match decision.signal.side() {
            Some(side) => side,
            None => return Ok(()),
        };

        // Expected price comes from the most recent contributing
        // signal; risk falls back to the time-series store when the
        // signal carried none.
        let expected_price = contributing
            .last()
            .and_then(|s| s.price_target)
            .unwrap_or(0.0);

        let avg = |values: Vec<f64>| -> Option<f64> {
            if values.is_empty() {
                None
            } else {
                Some(values.iter().sum::<f64>() / values.len() as f64)
            }
        };
        let avg_stop = avg(contributing.iter().filter_map(|s| s.stop_loss).collect());
        let avg_tp = avg(contributing.iter().filter_map(|s| s.take_profit).collect());
        let avg_target = avg(contributing.iter().filter_map(|s| s.price_target).collect());

        let confidence = decision.confidence.min(1.0);
        let reasoning = decision.reasoning.join("; ");

        let mut metadata = Map::new();
        metadata.insert(
            "fusion_strategy".to_string(),
            json!(self.engine.strategy().as_str()),
        );
        metadata.insert("num_signals".to_string(), json!(contributing.len()));
        metadata.insert(
            "signal_agents".to_string(),
            json!(
                contributing
                    .iter()
                    .map(|s| s.agent_type.clone())
                    .collect::<Vec<_>>()
            ),
        );
        metadata.insert("raw_confidence".to_string(), json!(decision.confidence));
        if let Some(stop) = avg_stop {
            metadata.insert("stop_loss".to_string(), json!(stop));
        }
        if let Some(tp) = avg_tp {
            metadata.insert("take_profit".to_string(), json!(tp));
        }
        metadata.insert(
            "fusion_details".to_string(),
            Value::Object(decision.details.clone()),
        );

        let intent = TradeIntent {
            symbol: symbol.to_string(),
            side,
            quantity: 0.0, // sized by the risk core
            expected_price,
            signals: contributing.to_vec(),
            strategy_name: self.engine.strategy().as_str().to_string(),
            confidence,
            reasoning: reasoning.clone(),
        };

        let correlation_id = Uuid::new_v4().to_string();
        let mut envelope = Envelope::new(self.name.clone(), Payload::Intent(intent));
        envelope.correlation_id = Some(correlation_id);
        envelope.metadata = metadata.clone();

        publish(
            self.bus.as_ref(),
            &self.name,
            TOPIC_INTENT,
            INTENT_PRIORITY,
            envelope,
        )
        .await?;

        let row = crate::domain::repositories::DecisionRow {
            symbol: symbol.to_string(),
            signal_type: decision.signal.to_string(),
            confidence: decision.confidence,
            fusion_strategy: self.engine.strategy().as_str().to_string(),
            num_signals: contributing.len() as i64,
            reasoning,
            fusion_details: Value::Object(decision.details.clone()),
            price_target: avg_target,
            stop_loss: avg_stop,
            take_profit: avg_tp,
            metadata: Value::Object(metadata),
        };
        if let Err(e) = self.decisions.save(&row).await {
            warn!(symbol = %symbol, error = %e, "Failed to persist strategy decision");
        }

        Ok(())
    }

    /// Prune stale signals everywhere and evict empty buffers.
    fn janitor(&mut self, now: DateTime<Utc>) {
        let timeout = self.config.signal_timeout;
        let mut pruned = 0;
        self.buffers.retain(|_, buffer| {
            pruned += buffer.prune(now, timeout);
            !buffer.is_empty()
        });
        if pruned > 0 {
            debug!(pruned, buffers = self.buffers.len(), "Janitor pass complete");
        }
    }

    #[cfg(test)]
    pub fn buffer(&self, symbol: &str) -> Option<&SignalBuffer> {
        self.buffers.get(symbol)
    }
}

#[async_trait]
impl Worker for FusionWorker {
    type Event = ();

    fn name(&self) -> &str {
        &self.name
    }

    fn worker_type(&self) -> &str {
        "fusion"
    }

    fn config_store(&self) -> Option<Arc<dyn WorkerConfigRepository>> {
        self.config_store.clone()
    }

    async fn configure(&mut self, config: Value) -> Result<()> {
        self.apply_config(&config)
    }

    fn subscriptions(&self) -> Vec<String> {
        vec![
            "signals.tech".to_string(),
            "signals.fundamental".to_string(),
            "signals.sentiment".to_string(),
        ]
    }

    async fn handle(&mut self, topic: &str, envelope: Envelope) -> Result<()> {
        match envelope.payload.clone() {
            Payload::Signal(signal) => {
                self.admit_signal(&envelope, signal).await;
                Ok(())
            }
            other => {
                debug!(topic = %topic, "Ignoring non-signal payload: {:?}", other);
                Ok(())
            }
        }
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.config.decision_interval)
    }

    async fn tick(&mut self) -> Result<()> {
        self.decision_pass(Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bus::MemoryBus;
    use crate::infrastructure::mock::{MockDecisionRepository, MockSignalRepository};

    fn signal_envelope(
        agent: &str,
        kind: SignalKind,
        confidence: f64,
        price_target: Option<f64>,
    ) -> (Envelope, TradingSignal) {
        let signal = TradingSignal {
            agent_type: agent.to_string(),
            symbol: "BTC/USDT".to_string(),
            signal: kind,
            confidence,
            price_target,
            stop_loss: None,
            take_profit: None,
            reasoning: Some("unit".to_string()),
            indicators: Map::new(),
        };
        let envelope = Envelope::new(format!("{}_worker", agent), Payload::Signal(signal.clone()));
        (envelope, signal)
    }

    fn worker_with_bus() -> (FusionWorker, Arc<MemoryBus>) {
        let bus = Arc::new(MemoryBus::new());
        let worker = FusionWorker::new(
            "fusion_core",
            FusionConfig::default(),
            bus.clone(),
            Arc::new(MockDecisionRepository::default()),
            Arc::new(MockSignalRepository::default()),
        );
        (worker, bus)
    }

    async fn probe(bus: &MemoryBus) -> tokio::sync::mpsc::Receiver<crate::domain::ports::Delivery> {
        bus.subscribe("probe.trade.intent", "trade.intent")
            .await
            .unwrap()
    }

    async fn recv_intent(
        rx: &mut tokio::sync::mpsc::Receiver<crate::domain::ports::Delivery>,
    ) -> Option<Envelope> {
        match tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
            Ok(Some(delivery)) => Some(Envelope::decode(&delivery.body).unwrap()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_two_strong_buys_produce_intent() {
        let (mut worker, bus) = worker_with_bus();
        let mut rx = probe(&bus).await;

        let (env1, sig1) = signal_envelope("technical", SignalKind::Buy, 0.8, Some(50000.0));
        let (env2, sig2) = signal_envelope("sentiment", SignalKind::Buy, 0.7, Some(50100.0));
        worker.admit_signal(&env1, sig1).await;
        worker.admit_signal(&env2, sig2).await;

        worker.decision_pass(Utc::now()).await.unwrap();

        let envelope = recv_intent(&mut rx).await.expect("intent expected");
        match envelope.payload {
            Payload::Intent(intent) => {
                assert_eq!(intent.side, crate::domain::types::Side::Buy);
                assert!(intent.confidence >= 0.6);
                assert!((0.0..=1.0).contains(&intent.confidence));
                assert_eq!(intent.quantity, 0.0);
                assert_eq!(intent.expected_price, 50100.0);
                assert_eq!(intent.signals.len(), 2);
            }
            other => panic!("expected intent, got {:?}", other),
        }
        assert!(envelope.correlation_id.is_some());
    }

    #[tokio::test]
    async fn test_min_signals_minus_one_produces_nothing() {
        let (mut worker, bus) = worker_with_bus();
        let mut rx = probe(&bus).await;
        let (env, sig) = signal_envelope("technical", SignalKind::Buy, 0.9, Some(50000.0));
        worker.admit_signal(&env, sig).await;

        worker.decision_pass(Utc::now()).await.unwrap();
        assert!(recv_intent(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn test_conflicting_weak_signals_suppressed() {
        let (mut worker, bus) = worker_with_bus();
        let mut rx = probe(&bus).await;
        let (env1, sig1) = signal_envelope("technical", SignalKind::Buy, 0.55, Some(50000.0));
        let (env2, sig2) = signal_envelope("sentiment", SignalKind::Sell, 0.58, Some(50000.0));
        worker.admit_signal(&env1, sig1).await;
        worker.admit_signal(&env2, sig2).await;

        worker.decision_pass(Utc::now()).await.unwrap();
        assert!(recv_intent(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn test_stale_signals_do_not_fuse() {
        let (mut worker, bus) = worker_with_bus();
        let mut rx = probe(&bus).await;

        let (mut env1, sig1) = signal_envelope("technical", SignalKind::Buy, 0.8, Some(50000.0));
        let (mut env2, sig2) = signal_envelope("sentiment", SignalKind::Buy, 0.9, Some(50000.0));
        env1.timestamp = Utc::now() - chrono::Duration::seconds(400);
        env2.timestamp = Utc::now() - chrono::Duration::seconds(500);
        worker.admit_signal(&env1, sig1).await;
        worker.admit_signal(&env2, sig2).await;

        worker.decision_pass(Utc::now()).await.unwrap();
        assert!(recv_intent(&mut rx).await.is_none());
        // Janitor evicted the emptied buffer.
        assert!(worker.buffer("BTC/USDT").is_none());
    }

    #[tokio::test]
    async fn test_pending_count_resets_after_pass() {
        let (mut worker, _bus) = worker_with_bus();
        let (env1, sig1) = signal_envelope("technical", SignalKind::Buy, 0.8, Some(50000.0));
        let (env2, sig2) = signal_envelope("sentiment", SignalKind::Buy, 0.7, Some(50000.0));
        worker.admit_signal(&env1, sig1).await;
        worker.admit_signal(&env2, sig2).await;

        worker.decision_pass(Utc::now()).await.unwrap();
        assert_eq!(worker.buffer("BTC/USDT").unwrap().pending_count, 0);
    }

    #[tokio::test]
    async fn test_persisted_config_overrides_defaults() {
        let (mut worker, _bus) = worker_with_bus();
        let persisted = serde_json::json!({
            "fusion_strategy": "consensus",
            "min_signals": 3,
            "min_confidence": 0.7,
            "signal_timeout_seconds": 120,
            "decision_interval_seconds": 5,
            "unknown_future_option": "ignored"
        });
        worker.configure(persisted).await.unwrap();

        assert_eq!(
            worker.engine.strategy(),
            crate::fusion::policy::FusionStrategy::Consensus
        );
        assert_eq!(worker.config.min_signals, 3);
        assert_eq!(worker.config.min_confidence, 0.7);
        assert_eq!(worker.config.signal_timeout, Duration::from_secs(120));
        assert_eq!(worker.tick_interval(), Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_invalid_persisted_config_is_rejected() {
        let (mut worker, _bus) = worker_with_bus();
        let bad = serde_json::json!({"min_confidence": 1.5});
        assert!(worker.configure(bad).await.is_err());
    }

    #[tokio::test]
    async fn test_confidence_exactly_at_threshold_emits() {
        let bus = Arc::new(MemoryBus::new());
        let mut config = FusionConfig::default();
        config.fusion_strategy = crate::fusion::policy::FusionStrategy::Consensus;
        let mut worker = FusionWorker::new(
            "fusion_core",
            config,
            bus.clone(),
            Arc::new(MockDecisionRepository::default()),
            Arc::new(MockSignalRepository::default()),
        );
        let mut rx = probe(&bus).await;

        // Consensus of two agreeing signals at exactly 0.60 fuses to
        // confidence 0.60; the inclusive gate lets it through.
        let (env1, sig1) = signal_envelope("technical", SignalKind::Buy, 0.6, Some(50000.0));
        let (env2, sig2) = signal_envelope("sentiment", SignalKind::Buy, 0.6, Some(50000.0));
        worker.admit_signal(&env1, sig1).await;
        worker.admit_signal(&env2, sig2).await;

        worker.decision_pass(Utc::now()).await.unwrap();
        assert!(recv_intent(&mut rx).await.is_some());
    }
}
