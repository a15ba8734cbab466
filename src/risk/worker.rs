use crate::config::RiskConfig;
use crate::domain::messages::{
    Envelope, OrderRequest, Payload, PositionUpdate, RiskAssessment, TradeIntent,
};
use crate::domain::ports::{ExchangeGateway, MarketStore, MessageBus};
use crate::domain::repositories::{
    AssessmentRepository, AssessmentRow, PositionRepository, WorkerConfigRepository,
};
use crate::domain::types::{OrderType, Side, base_asset, quote_asset};
use crate::risk::assessment::{
    PortfolioPosition, TradeAssessment, TradeValidator, ValidationRequest, portfolio_risk,
};
use crate::risk::sizing::{PositionSizer, SizedPosition, SizingRequest};
use crate::risk::stops::{StopContext, StopLevels, StopPlanner};
use crate::runtime::{Worker, publish};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const TOPIC_ORDER: &str = "trade.order";
const TOPIC_REJECTION: &str = "trade.rejection";
const ORDER_PRIORITY: u8 = 9;
const REJECTION_PRIORITY: u8 = 7;

/// Risk Core worker: sizes, protects, and validates every trade
/// intent, emitting an order or a rejection.
pub struct RiskWorker {
    name: String,
    config: RiskConfig,
    bus: Arc<dyn MessageBus>,
    gateway: Arc<dyn ExchangeGateway>,
    market: Arc<dyn MarketStore>,
    assessments: Arc<dyn AssessmentRepository>,
    positions: Arc<dyn PositionRepository>,
    sizer: PositionSizer,
    planner: StopPlanner,
    validator: TradeValidator,
    open_positions: Vec<PortfolioPosition>,
    current_portfolio_risk: f64,
    config_store: Option<Arc<dyn WorkerConfigRepository>>,
}

impl RiskWorker {
    pub fn new(
        name: impl Into<String>,
        config: RiskConfig,
        bus: Arc<dyn MessageBus>,
        gateway: Arc<dyn ExchangeGateway>,
        market: Arc<dyn MarketStore>,
        assessments: Arc<dyn AssessmentRepository>,
        positions: Arc<dyn PositionRepository>,
    ) -> Self {
        let sizer = PositionSizer::new(
            config.account_balance,
            config.max_portfolio_risk,
            config.position_sizing_method,
        );
        let planner = StopPlanner::new(config.stop_loss_method, 2.0);
        let validator = TradeValidator::new(
            config.max_portfolio_risk,
            config.max_position_risk,
            config.min_rr_ratio,
            config.min_confidence,
        );
        Self {
            name: name.into(),
            config,
            bus,
            gateway,
            market,
            assessments,
            positions,
            sizer,
            planner,
            validator,
            open_positions: Vec::new(),
            current_portfolio_risk: 0.0,
            config_store: None,
        }
    }

    pub fn with_config_store(mut self, store: Arc<dyn WorkerConfigRepository>) -> Self {
        self.config_store = Some(store);
        self
    }

    pub fn current_portfolio_risk(&self) -> f64 {
        self.current_portfolio_risk
    }

    /// Apply recognized persisted options, then rebuild the sizing
    /// and validation engines they parameterize.
    fn apply_config(&mut self, config: &Value) -> Result<()> {
        if let Some(balance) = config.get("account_balance").and_then(Value::as_f64) {
            if balance < 0.0 {
                anyhow::bail!("account_balance must be non-negative: {}", balance);
            }
            self.config.account_balance = balance;
        }
        if let Some(risk) = config.get("max_portfolio_risk").and_then(Value::as_f64) {
            self.config.max_portfolio_risk = risk;
        }
        if let Some(risk) = config.get("max_position_risk").and_then(Value::as_f64) {
            self.config.max_position_risk = risk;
        }
        if let Some(method) = config
            .get("position_sizing_method")
            .and_then(Value::as_str)
        {
            self.config.position_sizing_method = method.parse()?;
        }
        if let Some(method) = config.get("stop_loss_method").and_then(Value::as_str) {
            self.config.stop_loss_method = method.parse()?;
        }
        if let Some(confidence) = config.get("min_confidence").and_then(Value::as_f64) {
            self.config.min_confidence = confidence;
        }
        if let Some(ratio) = config.get("min_rr_ratio").and_then(Value::as_f64) {
            self.config.min_rr_ratio = ratio;
        }

        self.sizer = PositionSizer::new(
            self.config.account_balance,
            self.config.max_portfolio_risk,
            self.config.position_sizing_method,
        );
        self.planner = StopPlanner::new(self.config.stop_loss_method, 2.0);
        self.validator = TradeValidator::new(
            self.config.max_portfolio_risk,
            self.config.max_position_risk,
            self.config.min_rr_ratio,
            self.config.min_confidence,
        );
        Ok(())
    }

    /// Rebuild portfolio state from the relational store: the list of
    /// OPEN positions and the scalar portfolio risk.
    pub async fn refresh_portfolio_state(&mut self) {
        match self.positions.find_open().await {
            Ok(rows) => {
                self.open_positions = rows
                    .iter()
                    .map(|row| PortfolioPosition {
                        symbol: row.symbol.clone(),
                        size_usd: row.quantity * row.entry_price,
                        entry_price: row.entry_price,
                        stop_loss: row.stop_loss,
                    })
                    .collect();
                self.current_portfolio_risk =
                    portfolio_risk(&self.open_positions, self.config.account_balance);
                debug!(
                    positions = self.open_positions.len(),
                    portfolio_risk = self.current_portfolio_risk,
                    "Portfolio state refreshed"
                );
            }
            Err(e) => {
                warn!(error = %e, "Failed to load portfolio state; keeping previous view");
            }
        }
    }

    /// Full per-intent pipeline: price, market context, stops,
    /// sizing, validation, balance check, persistence, publish.
    pub async fn assess_intent(&mut self, envelope: &Envelope, intent: TradeIntent) -> Result<()> {
        let symbol = intent.symbol.clone();
        let intent_id = envelope
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // Redelivered intents collapse on the persisted assessment.
        match self.assessments.exists(&intent_id).await {
            Ok(true) => {
                info!(symbol = %symbol, intent_id = %intent_id, "Intent already assessed; dropping redelivery");
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Assessment lookup failed; proceeding"),
        }

        info!(
            symbol = %symbol,
            side = %intent.side,
            confidence = intent.confidence,
            intent_id = %intent_id,
            "Trade intent received"
        );

        let price = match self.resolve_price(&symbol, intent.expected_price).await {
            Some(price) => price,
            None => {
                // No fresh price anywhere: reject rather than trade
                // against a guess.
                warn!(symbol = %symbol, intent_id = %intent_id, "No price available; rejecting intent");
                let assessment = TradeAssessment {
                    symbol: symbol.clone(),
                    approved: false,
                    risk_score: 1.0,
                    position_size: 0.0,
                    max_loss: 0.0,
                    var_contribution: 0.0,
                    portfolio_risk_after: self.current_portfolio_risk,
                    rejection_reason: Some("No price available for symbol".to_string()),
                    metrics: Map::new(),
                };
                self.persist_assessment(&intent_id, &intent, &assessment, None, None)
                    .await;
                self.publish_rejection(&intent_id, &intent, &assessment)
                    .await?;
                return Ok(());
            }
        };

        // Market context is best-effort: absent ATR or stddev just
        // degrades the stop method.
        let atr = self
            .market
            .last_indicator(&symbol, "atr", ChronoDuration::hours(1))
            .await
            .unwrap_or_default();
        let price_std = self
            .market
            .close_stddev(&symbol, ChronoDuration::hours(24))
            .await
            .unwrap_or_default();

        let stops = self.planner.place(
            price,
            intent.side,
            &StopContext {
                atr,
                price_std,
                custom_stop: envelope.metadata_f64("stop_loss"),
                custom_tp: envelope.metadata_f64("take_profit"),
                ..Default::default()
            },
        );

        let sized = self.sizer.size(&SizingRequest {
            price,
            confidence: intent.confidence,
            stop_loss: Some(stops.stop_loss),
            take_profit: Some(stops.take_profit),
            atr,
            current_portfolio_risk: self.current_portfolio_risk,
        });

        let assessment = self.validator.validate(&ValidationRequest {
            symbol: &symbol,
            confidence: intent.confidence,
            position_size: sized.size_usd,
            risk_amount: sized.risk_amount,
            reward_risk_ratio: stops.reward_risk_ratio,
            current_portfolio_risk: self.current_portfolio_risk,
            account_balance: self.config.account_balance,
            open_positions: &self.open_positions,
        });

        self.persist_assessment(&intent_id, &intent, &assessment, Some(&sized), Some(&stops))
            .await;

        if !assessment.approved {
            warn!(
                symbol = %symbol,
                reason = assessment.rejection_reason.as_deref().unwrap_or(""),
                risk_score = assessment.risk_score,
                "Trade rejected"
            );
            self.publish_rejection(&intent_id, &intent, &assessment)
                .await?;
            return Ok(());
        }

        // Live balance check; gateway trouble lets the order through
        // and the exchange has the final word.
        if let Some(reason) = self
            .balance_shortfall(&symbol, intent.side, sized.quantity, sized.size_usd)
            .await
        {
            warn!(symbol = %symbol, reason = %reason, "Order blocked by balance check");
            return Ok(());
        }

        info!(
            symbol = %symbol,
            side = %intent.side,
            quantity = sized.quantity,
            size_usd = sized.size_usd,
            stop_loss = stops.stop_loss,
            take_profit = stops.take_profit,
            risk_score = assessment.risk_score,
            "Trade approved"
        );

        self.publish_order(&intent_id, &intent, price, &sized, &stops)
            .await?;

        // The approved trade consumes its slice of the risk budget
        // immediately; position updates will reconcile it later.
        self.current_portfolio_risk = assessment.portfolio_risk_after;
        Ok(())
    }

    /// Price resolution chain: intent price, then the freshest close
    /// from the time-series store, then the configured fallback.
    /// Every hop is logged.
    async fn resolve_price(&self, symbol: &str, expected_price: f64) -> Option<f64> {
        if expected_price > 0.0 {
            return Some(expected_price);
        }

        match self.market.last_close(symbol, ChronoDuration::hours(1)).await {
            Ok(Some(close)) if close > 0.0 => {
                warn!(symbol = %symbol, close, "Intent carried no price; using last close");
                return Some(close);
            }
            Ok(_) => {}
            Err(e) => warn!(symbol = %symbol, error = %e, "Time-series price lookup failed"),
        }

        if self.config.price_fallback > 0.0 {
            warn!(
                symbol = %symbol,
                fallback = self.config.price_fallback,
                "Using configured fallback price"
            );
            return Some(self.config.price_fallback);
        }
        None
    }

    /// Returns the shortfall reason when the account cannot cover the
    /// order, `None` when it can or when the check itself fails.
    async fn balance_shortfall(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        size_usd: f64,
    ) -> Option<String> {
        let balance = match self.gateway.fetch_balance().await {
            Ok(balance) => balance,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Balance check failed; allowing order");
                return None;
            }
        };

        match side {
            Side::Buy => {
                let quote = quote_asset(symbol);
                let free = balance.free_of(quote);
                if free < size_usd {
                    return Some(format!(
                        "Insufficient {} balance: have {:.2}, need {:.2}",
                        quote, free, size_usd
                    ));
                }
            }
            Side::Sell => {
                let base = base_asset(symbol);
                let free = balance.free_of(base);
                if free < quantity {
                    return Some(format!(
                        "Insufficient {} balance: have {}, need {}",
                        base, free, quantity
                    ));
                }
            }
        }
        None
    }

    async fn persist_assessment(
        &self,
        intent_id: &str,
        intent: &TradeIntent,
        assessment: &TradeAssessment,
        sized: Option<&SizedPosition>,
        stops: Option<&StopLevels>,
    ) {
        let mut metadata = Map::new();
        metadata.insert("trade_intent_id".to_string(), json!(intent_id));
        metadata.insert("confidence".to_string(), json!(intent.confidence));
        if let Some(sized) = sized {
            metadata.insert("kelly_fraction".to_string(), json!(sized.kelly_fraction));
            metadata.insert("sizing_method".to_string(), json!(sized.method));
        }
        if let Some(stops) = stops {
            metadata.insert("stop_loss".to_string(), json!(stops.stop_loss));
            metadata.insert("take_profit".to_string(), json!(stops.take_profit));
            metadata.insert("rr_ratio".to_string(), json!(stops.reward_risk_ratio));
        }
        for (key, value) in &assessment.metrics {
            metadata.insert(key.clone(), value.clone());
        }

        let row = AssessmentRow {
            intent_id: intent_id.to_string(),
            symbol: intent.symbol.clone(),
            risk_score: assessment.risk_score,
            position_size: assessment.position_size,
            var_estimate: assessment.var_contribution,
            max_loss: assessment.max_loss,
            approved: assessment.approved,
            rejection_reason: assessment.rejection_reason.clone(),
            metadata: Value::Object(metadata),
        };
        if let Err(e) = self.assessments.save(&row).await {
            warn!(symbol = %intent.symbol, error = %e, "Failed to persist risk assessment");
        }
    }

    async fn publish_order(
        &self,
        intent_id: &str,
        intent: &TradeIntent,
        price: f64,
        sized: &SizedPosition,
        stops: &StopLevels,
    ) -> Result<()> {
        let mut risk_params = Map::new();
        risk_params.insert("position_size_usd".to_string(), json!(sized.size_usd));
        risk_params.insert("risk_amount".to_string(), json!(sized.risk_amount));
        risk_params.insert("kelly_fraction".to_string(), json!(sized.kelly_fraction));
        risk_params.insert("stop_method".to_string(), json!(stops.method));
        risk_params.insert("rr_ratio".to_string(), json!(stops.reward_risk_ratio));
        risk_params.insert("expected_price".to_string(), json!(price));

        let order = OrderRequest {
            exchange: self.gateway.exchange_id().to_string(),
            symbol: intent.symbol.clone(),
            side: intent.side,
            order_type: OrderType::Market,
            quantity: sized.quantity,
            price: None,
            stop_loss: Some(stops.stop_loss),
            take_profit: Some(stops.take_profit),
            leverage: 1.0,
            risk_approved: true,
            risk_params,
        };

        let mut metadata = Map::new();
        metadata.insert("trade_intent_id".to_string(), json!(intent_id));
        metadata.insert("confidence".to_string(), json!(intent.confidence));
        metadata.insert("sizing_method".to_string(), json!(sized.method));
        metadata.insert("strategy_reasoning".to_string(), json!(intent.reasoning));

        let mut envelope = Envelope::new(self.name.clone(), Payload::Order(order));
        envelope.correlation_id = Some(intent_id.to_string());
        envelope.metadata = metadata;

        publish(
            self.bus.as_ref(),
            &self.name,
            TOPIC_ORDER,
            ORDER_PRIORITY,
            envelope,
        )
        .await
    }

    async fn publish_rejection(
        &self,
        intent_id: &str,
        intent: &TradeIntent,
        assessment: &TradeAssessment,
    ) -> Result<()> {
        let mut metadata = Map::new();
        metadata.insert("trade_intent_id".to_string(), json!(intent_id));
        metadata.insert("confidence".to_string(), json!(intent.confidence));

        let rejection = RiskAssessment {
            symbol: intent.symbol.clone(),
            approved: false,
            risk_score: assessment.risk_score,
            position_size: assessment.position_size,
            var_estimate: assessment.var_contribution,
            max_loss: assessment.max_loss,
            rejection_reason: assessment.rejection_reason.clone(),
            risk_metrics: assessment.metrics.clone(),
        };

        let mut envelope = Envelope::new(self.name.clone(), Payload::Risk(rejection));
        envelope.correlation_id = Some(intent_id.to_string());
        envelope.metadata = metadata;

        publish(
            self.bus.as_ref(),
            &self.name,
            TOPIC_REJECTION,
            REJECTION_PRIORITY,
            envelope,
        )
        .await
    }

    async fn on_position_update(&mut self, update: &PositionUpdate) {
        debug!(symbol = %update.symbol, "Position update received; refreshing portfolio state");
        self.refresh_portfolio_state().await;
    }
}

#[async_trait]
impl Worker for RiskWorker {
    type Event = ();

    fn name(&self) -> &str {
        &self.name
    }

    fn worker_type(&self) -> &str {
        "risk"
    }

    fn config_store(&self) -> Option<Arc<dyn WorkerConfigRepository>> {
        self.config_store.clone()
    }

    async fn configure(&mut self, config: Value) -> Result<()> {
        self.apply_config(&config)
    }

    async fn setup(&mut self) -> Result<()> {
        self.refresh_portfolio_state().await;
        info!(
            account_balance = self.config.account_balance,
            max_portfolio_risk = self.config.max_portfolio_risk,
            portfolio_risk = self.current_portfolio_risk,
            positions = self.open_positions.len(),
            "Risk worker initialized"
        );
        Ok(())
    }

    fn subscriptions(&self) -> Vec<String> {
        vec!["trade.intent".to_string(), "position.update".to_string()]
    }

    async fn handle(&mut self, topic: &str, envelope: Envelope) -> Result<()> {
        match envelope.payload.clone() {
            Payload::Intent(intent) => self.assess_intent(&envelope, intent).await,
            Payload::Position(update) => {
                self.on_position_update(&update).await;
                Ok(())
            }
            other => {
                debug!(topic = %topic, "Ignoring unexpected payload: {:?}", other);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::Delivery;
    use crate::infrastructure::bus::MemoryBus;
    use crate::infrastructure::mock::{
        MockAssessmentRepository, MockExchangeGateway, MockMarketStore, MockPositionRepository,
    };
    use tokio::sync::mpsc::Receiver;

    struct Fixture {
        worker: RiskWorker,
        orders: Receiver<Delivery>,
        rejections: Receiver<Delivery>,
        gateway: Arc<MockExchangeGateway>,
        assessments: Arc<MockAssessmentRepository>,
    }

    async fn fixture(config: RiskConfig) -> Fixture {
        let bus = Arc::new(MemoryBus::new());
        let gateway = Arc::new(MockExchangeGateway::new("binance"));
        gateway.set_balance("USDT", 100000.0).await;
        gateway.set_balance("BTC", 10.0).await;
        let market = Arc::new(MockMarketStore::default());
        market.set_indicator("BTC/USDT", "atr", 1000.0).await;
        let assessments = Arc::new(MockAssessmentRepository::default());
        let positions = Arc::new(MockPositionRepository::default());

        let orders = bus.subscribe("probe.trade.order", "trade.order").await.unwrap();
        let rejections = bus
            .subscribe("probe.trade.rejection", "trade.rejection")
            .await
            .unwrap();

        let worker = RiskWorker::new(
            "risk_core",
            config,
            bus.clone(),
            gateway.clone(),
            market,
            assessments.clone(),
            positions,
        );
        Fixture {
            worker,
            orders,
            rejections,
            gateway,
            assessments,
        }
    }

    fn intent_envelope(confidence: f64, expected_price: f64) -> (Envelope, TradeIntent) {
        let intent = TradeIntent {
            symbol: "BTC/USDT".to_string(),
            side: Side::Buy,
            quantity: 0.0,
            expected_price,
            signals: Vec::new(),
            strategy_name: "hybrid".to_string(),
            confidence,
            reasoning: "test".to_string(),
        };
        let envelope = Envelope::new("fusion_core", Payload::Intent(intent.clone()))
            .with_correlation(Uuid::new_v4().to_string());
        (envelope, intent)
    }

    async fn recv(rx: &mut Receiver<Delivery>) -> Option<Envelope> {
        match tokio::time::timeout(std::time::Duration::from_millis(100), rx.recv()).await {
            Ok(Some(delivery)) => Some(Envelope::decode(&delivery.body).unwrap()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_approved_buy_publishes_order() {
        let mut fx = fixture(RiskConfig::default()).await;
        let (envelope, intent) = intent_envelope(0.74, 50000.0);
        fx.worker.assess_intent(&envelope, intent).await.unwrap();

        let order_env = recv(&mut fx.orders).await.expect("order expected");
        assert_eq!(order_env.correlation_id, envelope.correlation_id);
        match order_env.payload {
            Payload::Order(order) => {
                assert!(order.risk_approved);
                assert!(order.quantity > 0.0);
                // ATR stops: 50000 -/+ 2000 with rr 2.
                assert_eq!(order.stop_loss, Some(48000.0));
                assert_eq!(order.take_profit, Some(54000.0));
                // Stop below the mark for a BUY.
                assert!(order.stop_loss.unwrap() < 50000.0);
                assert_eq!(order.expected_price(), Some(50000.0));
            }
            other => panic!("expected order, got {:?}", other),
        }
        // Approval consumes risk budget.
        assert!(fx.worker.current_portfolio_risk() > 0.0);
    }

    #[tokio::test]
    async fn test_low_confidence_intent_rejected() {
        let mut fx = fixture(RiskConfig::default()).await;
        let (envelope, intent) = intent_envelope(0.4, 50000.0);
        fx.worker.assess_intent(&envelope, intent).await.unwrap();

        assert!(recv(&mut fx.orders).await.is_none());
        let rejection = recv(&mut fx.rejections).await.expect("rejection expected");
        match rejection.payload {
            Payload::Risk(assessment) => {
                assert!(!assessment.approved);
                assert!(assessment.rejection_reason.unwrap().contains("Low confidence"));
            }
            other => panic!("expected risk assessment, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_redelivered_intent_is_dropped() {
        let mut fx = fixture(RiskConfig::default()).await;
        let (envelope, intent) = intent_envelope(0.74, 50000.0);
        fx.worker
            .assess_intent(&envelope, intent.clone())
            .await
            .unwrap();
        assert!(recv(&mut fx.orders).await.is_some());

        // Same correlation id again: no second order.
        fx.worker.assess_intent(&envelope, intent).await.unwrap();
        assert!(recv(&mut fx.orders).await.is_none());
        assert_eq!(fx.assessments.count().await, 1);
    }

    #[tokio::test]
    async fn test_no_price_rejects_intent() {
        let mut fx = fixture(RiskConfig::default()).await;
        let (envelope, intent) = intent_envelope(0.74, 0.0);
        fx.worker.assess_intent(&envelope, intent).await.unwrap();

        assert!(recv(&mut fx.orders).await.is_none());
        let rejection = recv(&mut fx.rejections).await.expect("rejection expected");
        match rejection.payload {
            Payload::Risk(assessment) => {
                assert!(assessment.rejection_reason.unwrap().contains("No price"));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_insufficient_balance_blocks_order() {
        let mut fx = fixture(RiskConfig::default()).await;
        fx.gateway.set_balance("USDT", 1.0).await;

        let (envelope, intent) = intent_envelope(0.74, 50000.0);
        fx.worker.assess_intent(&envelope, intent).await.unwrap();

        // Approved but blocked: neither an order nor a rejection.
        assert!(recv(&mut fx.orders).await.is_none());
        assert!(recv(&mut fx.rejections).await.is_none());
    }

    #[tokio::test]
    async fn test_balance_check_error_allows_order() {
        let mut fx = fixture(RiskConfig::default()).await;
        fx.gateway.fail_balance_fetch(true).await;

        let (envelope, intent) = intent_envelope(0.74, 50000.0);
        fx.worker.assess_intent(&envelope, intent).await.unwrap();
        assert!(recv(&mut fx.orders).await.is_some());
    }

    #[tokio::test]
    async fn test_intent_stops_pass_through() {
        let mut fx = fixture(RiskConfig::default()).await;
        let (mut envelope, intent) = intent_envelope(0.74, 50000.0);
        envelope
            .metadata
            .insert("stop_loss".to_string(), json!(47500.0));
        envelope
            .metadata
            .insert("take_profit".to_string(), json!(56000.0));

        fx.worker.assess_intent(&envelope, intent).await.unwrap();
        let order_env = recv(&mut fx.orders).await.expect("order expected");
        match order_env.payload {
            Payload::Order(order) => {
                assert_eq!(order.stop_loss, Some(47500.0));
                assert_eq!(order.take_profit, Some(56000.0));
            }
            other => panic!("expected order, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_position_update_refreshes_portfolio() {
        let bus = Arc::new(MemoryBus::new());
        let gateway = Arc::new(MockExchangeGateway::new("binance"));
        let market = Arc::new(MockMarketStore::default());
        let assessments = Arc::new(MockAssessmentRepository::default());
        let positions = Arc::new(MockPositionRepository::default());

        positions
            .insert_open("BTC/USDT", 0.1, 50000.0, Some(48000.0))
            .await;

        let mut worker = RiskWorker::new(
            "risk_core",
            RiskConfig::default(),
            bus,
            gateway,
            market,
            assessments,
            positions,
        );
        assert_eq!(worker.current_portfolio_risk(), 0.0);
        worker.refresh_portfolio_state().await;
        // 0.1 * 50000 * 0.04 / 10000 = 0.02
        assert!((worker.current_portfolio_risk() - 0.02).abs() < 1e-9);
    }
}
