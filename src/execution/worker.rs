use crate::config::ExecutionConfig;
use crate::domain::messages::{
    Envelope, ExecutionReport, OrderRequest, Payload, PositionUpdate,
};
use crate::domain::ports::{ExchangeGateway, GatewayOrder, GatewayOrderRequest, MessageBus};
use crate::domain::repositories::{
    ExecutionRow, OrderRepository, OrderRow, PositionRepository, PositionRow, TradeRepository,
    WorkerConfigRepository,
};
use crate::domain::types::{OrderStatus, OrderType, Side};
use crate::execution::ledger::{LedgerEvent, Position, PositionLedger};
use crate::execution::quality::{QualityReport, build_report};
use crate::runtime::{Worker, publish};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const TOPIC_EXECUTION: &str = "execution.report";
const TOPIC_POSITION: &str = "position.update";
const EXECUTION_PRIORITY: u8 = 8;
const POSITION_PRIORITY: u8 = 7;

/// Store writes for orders and positions are mandatory; they retry a
/// few times before being given up on with an error log.
const STORE_ATTEMPTS: usize = 3;
const STORE_BACKOFF: Duration = Duration::from_millis(50);

struct PendingOrder {
    request: OrderRequest,
    placed: Instant,
    exchange_order_id: Option<String>,
}

/// Execution Core worker: places orders, reconciles fills, owns the
/// position ledger, and reports execution quality.
pub struct ExecutionWorker {
    name: String,
    config: ExecutionConfig,
    bus: Arc<dyn MessageBus>,
    gateway: Arc<dyn ExchangeGateway>,
    trades: Arc<dyn TradeRepository>,
    orders: Arc<dyn OrderRepository>,
    positions: Arc<dyn PositionRepository>,
    ledger: PositionLedger,
    /// correlation_id -> order awaiting a terminal status.
    pending: HashMap<String, PendingOrder>,
    /// exchange order id -> correlation_id.
    by_exchange_id: HashMap<String, String>,
    events_tx: mpsc::Sender<GatewayOrder>,
    events_rx: Option<mpsc::Receiver<GatewayOrder>>,
    monitors: Vec<JoinHandle<()>>,
    config_store: Option<Arc<dyn WorkerConfigRepository>>,
}

impl ExecutionWorker {
    pub fn new(
        name: impl Into<String>,
        config: ExecutionConfig,
        bus: Arc<dyn MessageBus>,
        gateway: Arc<dyn ExchangeGateway>,
        trades: Arc<dyn TradeRepository>,
        orders: Arc<dyn OrderRepository>,
        positions: Arc<dyn PositionRepository>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        Self {
            name: name.into(),
            config,
            bus,
            gateway,
            trades,
            orders,
            positions,
            ledger: PositionLedger::new(),
            pending: HashMap::new(),
            by_exchange_id: HashMap::new(),
            events_tx,
            events_rx: Some(events_rx),
            monitors: Vec::new(),
            config_store: None,
        }
    }

    pub fn with_config_store(mut self, store: Arc<dyn WorkerConfigRepository>) -> Self {
        self.config_store = Some(store);
        self
    }

    fn apply_config(&mut self, config: &Value) -> Result<()> {
        if let Some(max_slippage) = config.get("max_slippage_pct").and_then(Value::as_f64) {
            if max_slippage < 0.0 {
                anyhow::bail!("max_slippage_pct must be non-negative: {}", max_slippage);
            }
            self.config.max_slippage_pct = max_slippage;
        }
        if let Some(interval) = config
            .get("monitoring_interval_seconds")
            .and_then(Value::as_u64)
        {
            self.config.monitoring_interval = Duration::from_secs(interval);
        }
        Ok(())
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Handle one approved order from the risk core.
    pub async fn handle_order(&mut self, envelope: &Envelope, request: OrderRequest) -> Result<()> {
        let correlation_id = envelope
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if self.pending.contains_key(&correlation_id) {
            info!(correlation = %correlation_id, "Order already in flight; dropping redelivery");
            return Ok(());
        }
        // An order row in a non-pending state means this correlation
        // already ran to placement; the redelivery is collapsed here.
        match self.orders.find(&correlation_id).await {
            Ok(Some(existing)) if existing.status != OrderStatus::Pending => {
                info!(
                    correlation = %correlation_id,
                    status = %existing.status,
                    "Order already processed; dropping redelivery"
                );
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => warn!(correlation = %correlation_id, error = %e, "Order lookup failed; proceeding"),
        }

        info!(
            symbol = %request.symbol,
            side = %request.side,
            order_type = %request.order_type,
            quantity = request.quantity,
            correlation = %correlation_id,
            "Order received"
        );

        // Persist intent-side order row before touching the exchange.
        let row = OrderRow {
            order_id: correlation_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            price: request.price,
            status: OrderStatus::Pending,
            created_at: Utc::now(),
            exchange_order_id: None,
            metadata: Value::Object(envelope.metadata.clone()),
        };
        if let Err(e) = with_retries(STORE_ATTEMPTS, || self.orders.save(&row)).await {
            error!(correlation = %correlation_id, error = %e, "Failed to pre-persist order; aborting placement");
            return Ok(());
        }

        self.pending.insert(
            correlation_id.clone(),
            PendingOrder {
                request: request.clone(),
                placed: Instant::now(),
                exchange_order_id: None,
            },
        );

        let gateway_request = GatewayOrderRequest {
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            price: request.price,
            trigger_price: match request.order_type {
                OrderType::StopLoss => request.stop_loss,
                OrderType::TakeProfit => request.take_profit,
                _ => None,
            },
            client_order_id: Some(correlation_id.clone()),
        };

        let placed = match self.gateway.create_order(&gateway_request).await {
            Ok(placed) => placed,
            Err(e) if e.is_transient() => {
                // Retries exhausted at the adapter; release reserved
                // exposure upstream.
                error!(correlation = %correlation_id, error = %e, "Order placement failed");
                let synthetic = synthetic_rejected(&request, &e.to_string());
                self.process_rejected(&correlation_id, synthetic).await;
                return Ok(());
            }
            Err(e) => {
                // Ambiguous failure: the order may live on the
                // exchange. Surface loudly and keep it pending for
                // operator reconciliation.
                error!(
                    correlation = %correlation_id,
                    error = %e,
                    "Ambiguous placement failure; order left pending for reconciliation"
                );
                return Ok(());
            }
        };

        if let Some(order) = self.pending.get_mut(&correlation_id) {
            order.exchange_order_id = Some(placed.order_id.clone());
        }
        self.by_exchange_id
            .insert(placed.order_id.clone(), correlation_id.clone());
        let _ = self
            .orders
            .update_status(&correlation_id, placed.status, Some(&placed.order_id))
            .await;

        match placed.status {
            OrderStatus::Filled => self.process_filled(&correlation_id, placed).await,
            OrderStatus::Rejected => self.process_rejected(&correlation_id, placed).await,
            OrderStatus::Open | OrderStatus::Partial | OrderStatus::Pending => {
                self.monitor_order(&placed).await;
            }
            OrderStatus::Cancelled | OrderStatus::Expired => {
                self.process_terminal(&correlation_id, placed).await;
            }
        }
        Ok(())
    }

    /// Subscribe to the gateway's order stream and forward this
    /// order's updates into the worker until it goes terminal.
    async fn monitor_order(&mut self, placed: &GatewayOrder) {
        let stream = match self.gateway.watch_orders(&placed.symbol).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    order_id = %placed.order_id,
                    error = %e,
                    "Order stream unavailable; relying on periodic reconciliation"
                );
                return;
            }
        };

        let order_id = placed.order_id.clone();
        let tx = self.events_tx.clone();
        let mut stream = stream;
        self.monitors.push(tokio::spawn(async move {
            while let Some(update) = stream.recv().await {
                if update.order_id != order_id {
                    continue;
                }
                let terminal = update.status.is_terminal();
                if tx.send(update).await.is_err() {
                    break;
                }
                if terminal {
                    break;
                }
            }
        }));
        debug!(order_id = %placed.order_id, symbol = %placed.symbol, "Monitoring open order");
    }

    /// One gateway update for a monitored order.
    pub async fn handle_gateway_update(&mut self, update: GatewayOrder) {
        let correlation_id = match self.by_exchange_id.get(&update.order_id) {
            Some(correlation_id) => correlation_id.clone(),
            None => {
                debug!(order_id = %update.order_id, "Update for unknown order; ignoring");
                return;
            }
        };

        match update.status {
            OrderStatus::Filled => self.process_filled(&correlation_id, update).await,
            OrderStatus::Rejected => self.process_rejected(&correlation_id, update).await,
            OrderStatus::Cancelled | OrderStatus::Expired => {
                self.process_terminal(&correlation_id, update).await;
            }
            OrderStatus::Open | OrderStatus::Partial | OrderStatus::Pending => {
                debug!(
                    order_id = %update.order_id,
                    status = %update.status,
                    filled = update.filled_quantity,
                    "Order progressing"
                );
                let _ = self
                    .orders
                    .update_status(&correlation_id, update.status, Some(&update.order_id))
                    .await;
            }
        }
    }

    /// Fill processing: runs exactly once per order, keyed on removal
    /// from the pending registry.
    async fn process_filled(&mut self, correlation_id: &str, execution: GatewayOrder) {
        let pending = match self.pending.remove(correlation_id) {
            Some(pending) => pending,
            None => {
                debug!(correlation = %correlation_id, "Fill for order no longer pending; ignoring");
                return;
            }
        };
        self.by_exchange_id.remove(&execution.order_id);
        let request = pending.request;

        let fills = self
            .gateway
            .fetch_order_trades(&execution.order_id, &execution.symbol)
            .await
            .unwrap_or_else(|e| {
                warn!(order_id = %execution.order_id, error = %e, "Fill lookup failed; using order totals");
                Vec::new()
            });

        let fees = if fills.is_empty() {
            execution.fee
        } else {
            fills.iter().map(|f| f.fee).sum()
        };
        let average_price = execution.average_price.unwrap_or_else(|| {
            let quantity: f64 = fills.iter().map(|f| f.quantity).sum();
            if quantity > 0.0 {
                fills.iter().map(|f| f.price * f.quantity).sum::<f64>() / quantity
            } else {
                request.expected_price().unwrap_or(0.0)
            }
        });
        let expected_price = request.expected_price().unwrap_or(average_price);

        let execution_time_ms = pending.placed.elapsed().as_secs_f64() * 1000.0;
        let report = build_report(
            &execution.order_id,
            &execution.symbol,
            execution.side,
            execution.filled_quantity,
            expected_price,
            average_price,
            fees,
            execution_time_ms,
        );

        // Strictly-greater comparison: slippage exactly at the limit
        // does not warn.
        if report.slippage.slippage_pct.abs() > self.config.max_slippage_pct {
            warn!(
                symbol = %execution.symbol,
                slippage_pct = report.slippage.slippage_pct,
                max_allowed = self.config.max_slippage_pct,
                rating = report.slippage.quality_rating.as_str(),
                "High slippage on fill"
            );
        }

        let mut position_metadata = Map::new();
        position_metadata.insert("order_id".to_string(), json!(execution.order_id));
        position_metadata.insert("execution_quality".to_string(), json!(report.quality_score));

        let event = self.ledger.apply_fill(
            &execution.symbol,
            execution.side,
            execution.filled_quantity,
            average_price,
            request.stop_loss,
            request.take_profit,
            position_metadata,
        );
        info!(
            symbol = %execution.symbol,
            action = ?event.action,
            quantity = execution.filled_quantity,
            avg_price = average_price,
            slippage_pct = report.slippage.slippage_pct,
            quality_score = report.quality_score,
            "Order filled"
        );

        self.persist_execution(&request, &execution, &report, fees).await;
        self.persist_position(&event.position).await;

        self.publish_execution_report(
            correlation_id,
            &request,
            &execution,
            average_price,
            fees,
            execution.filled_quantity,
            OrderStatus::Filled,
        )
        .await;
        self.publish_position_update(correlation_id, &event).await;

        // Protective orders for the entry, opposite side, same size.
        if matches!(request.order_type, OrderType::Market | OrderType::Limit) {
            self.place_protective_orders(&request, &execution).await;
        }

        let _ = self
            .orders
            .update_status(correlation_id, OrderStatus::Filled, Some(&execution.order_id))
            .await;
    }

    /// Rejected orders release reserved exposure upstream: a report
    /// with zero filled quantity, published exactly once.
    async fn process_rejected(&mut self, correlation_id: &str, execution: GatewayOrder) {
        let pending = match self.pending.remove(correlation_id) {
            Some(pending) => pending,
            None => return,
        };
        self.by_exchange_id.remove(&execution.order_id);
        let request = pending.request;

        error!(
            order_id = %execution.order_id,
            symbol = %execution.symbol,
            error = execution.error.as_deref().unwrap_or("unknown"),
            "Order rejected"
        );

        let mut metadata = Map::new();
        if let Some(err) = &execution.error {
            metadata.insert("error".to_string(), json!(err));
        }
        let row = ExecutionRow {
            exchange: request.exchange.clone(),
            symbol: execution.symbol.clone(),
            side: execution.side,
            order_type: request.order_type,
            quantity: 0.0,
            price: 0.0,
            fee: 0.0,
            fee_currency: execution.fee_currency.clone(),
            status: OrderStatus::Rejected,
            order_id: execution.order_id.clone(),
            execution_time: Utc::now(),
            metadata: Value::Object(metadata),
        };
        if let Err(e) = with_retries(STORE_ATTEMPTS, || self.trades.record_execution(&row)).await {
            error!(order_id = %execution.order_id, error = %e, "Failed to persist rejected execution");
        }

        self.publish_execution_report(
            correlation_id,
            &request,
            &execution,
            0.0,
            0.0,
            0.0,
            OrderStatus::Rejected,
        )
        .await;

        let _ = self
            .orders
            .update_status(correlation_id, OrderStatus::Rejected, Some(&execution.order_id))
            .await;
    }

    /// Cancelled or expired orders: report whatever did fill, then
    /// drop from the registry.
    async fn process_terminal(&mut self, correlation_id: &str, execution: GatewayOrder) {
        let pending = match self.pending.remove(correlation_id) {
            Some(pending) => pending,
            None => return,
        };
        self.by_exchange_id.remove(&execution.order_id);
        let request = pending.request;

        warn!(
            order_id = %execution.order_id,
            status = %execution.status,
            filled = execution.filled_quantity,
            "Order ended without a full fill"
        );

        if execution.filled_quantity > 0.0 {
            let average_price = execution
                .average_price
                .or_else(|| request.expected_price())
                .unwrap_or(0.0);
            let mut metadata = Map::new();
            metadata.insert("order_id".to_string(), json!(execution.order_id));
            let event = self.ledger.apply_fill(
                &execution.symbol,
                execution.side,
                execution.filled_quantity,
                average_price,
                request.stop_loss,
                request.take_profit,
                metadata,
            );
            self.persist_position(&event.position).await;
            self.publish_position_update(correlation_id, &event).await;
        }

        self.publish_execution_report(
            correlation_id,
            &request,
            &execution,
            execution.average_price.unwrap_or(0.0),
            execution.fee,
            execution.filled_quantity,
            execution.status,
        )
        .await;

        let _ = self
            .orders
            .update_status(correlation_id, execution.status, Some(&execution.order_id))
            .await;
    }

    async fn place_protective_orders(&mut self, request: &OrderRequest, execution: &GatewayOrder) {
        let exit_side = request.side.opposite();

        if let Some(stop_price) = request.stop_loss {
            let stop_request = GatewayOrderRequest {
                symbol: request.symbol.clone(),
                side: exit_side,
                order_type: OrderType::StopLoss,
                quantity: execution.filled_quantity,
                price: None,
                trigger_price: Some(stop_price),
                client_order_id: None,
            };
            match self.gateway.create_order(&stop_request).await {
                Ok(placed) => {
                    info!(symbol = %request.symbol, stop_price, order_id = %placed.order_id, "Stop-loss placed")
                }
                Err(e) => error!(symbol = %request.symbol, error = %e, "Stop-loss placement failed"),
            }
        }

        if let Some(tp_price) = request.take_profit {
            let tp_request = GatewayOrderRequest {
                symbol: request.symbol.clone(),
                side: exit_side,
                order_type: OrderType::TakeProfit,
                quantity: execution.filled_quantity,
                price: None,
                trigger_price: Some(tp_price),
                client_order_id: None,
            };
            match self.gateway.create_order(&tp_request).await {
                Ok(placed) => {
                    info!(symbol = %request.symbol, tp_price, order_id = %placed.order_id, "Take-profit placed")
                }
                Err(e) => error!(symbol = %request.symbol, error = %e, "Take-profit placement failed"),
            }
        }
    }

    async fn persist_execution(
        &self,
        request: &OrderRequest,
        execution: &GatewayOrder,
        report: &QualityReport,
        fees: f64,
    ) {
        let mut metadata = Map::new();
        metadata.insert(
            "slippage_pct".to_string(),
            json!(report.slippage.slippage_pct),
        );
        metadata.insert("quality_score".to_string(), json!(report.quality_score));
        metadata.insert(
            "quality_rating".to_string(),
            json!(report.slippage.quality_rating.as_str()),
        );
        metadata.insert(
            "execution_time_ms".to_string(),
            json!(report.execution_time_ms),
        );
        metadata.insert("total_cost".to_string(), json!(report.costs.total_cost));

        let row = ExecutionRow {
            exchange: request.exchange.clone(),
            symbol: execution.symbol.clone(),
            side: execution.side,
            order_type: request.order_type,
            quantity: execution.filled_quantity,
            price: report.average_fill_price,
            fee: fees,
            fee_currency: execution.fee_currency.clone(),
            status: OrderStatus::Filled,
            order_id: execution.order_id.clone(),
            execution_time: Utc::now(),
            metadata: Value::Object(metadata),
        };
        if let Err(e) = with_retries(STORE_ATTEMPTS, || self.trades.record_execution(&row)).await {
            error!(order_id = %execution.order_id, error = %e, "Failed to persist execution");
        }
    }

    async fn persist_position(&self, position: &Position) {
        let row = position_row(position, &self.config.exchange_id);
        if let Err(e) = with_retries(STORE_ATTEMPTS, || self.positions.upsert(&row)).await {
            error!(position_id = %position.position_id, error = %e, "Failed to persist position");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn publish_execution_report(
        &self,
        correlation_id: &str,
        request: &OrderRequest,
        execution: &GatewayOrder,
        average_price: f64,
        fee: f64,
        filled_quantity: f64,
        status: OrderStatus,
    ) {
        let report = ExecutionReport {
            order_id: execution.order_id.clone(),
            exchange: request.exchange.clone(),
            symbol: execution.symbol.clone(),
            side: execution.side,
            status,
            filled_quantity,
            average_price,
            total_value: filled_quantity * average_price,
            fee,
            fee_currency: execution.fee_currency.clone(),
            execution_time: Utc::now(),
        };

        let mut envelope = Envelope::new(self.name.clone(), Payload::Execution(report));
        envelope.correlation_id = Some(correlation_id.to_string());
        if let Err(e) = publish(
            self.bus.as_ref(),
            &self.name,
            TOPIC_EXECUTION,
            EXECUTION_PRIORITY,
            envelope,
        )
        .await
        {
            error!(correlation = %correlation_id, error = %e, "Failed to publish execution report");
        }
    }

    async fn publish_position_update(&self, correlation_id: &str, event: &LedgerEvent) {
        let position = &event.position;
        let update = PositionUpdate {
            symbol: position.symbol.clone(),
            side: position.side,
            quantity: position.quantity,
            entry_price: position.entry_price,
            current_price: position.current_price,
            unrealized_pnl: position.unrealized_pnl,
            realized_pnl: position.realized_pnl,
        };

        let mut metadata = Map::new();
        metadata.insert("position_id".to_string(), json!(position.position_id));
        metadata.insert("status".to_string(), json!(position.status.to_string()));

        let mut envelope = Envelope::new(self.name.clone(), Payload::Position(update));
        envelope.correlation_id = Some(correlation_id.to_string());
        envelope.metadata = metadata;
        if let Err(e) = publish(
            self.bus.as_ref(),
            &self.name,
            TOPIC_POSITION,
            POSITION_PRIORITY,
            envelope,
        )
        .await
        {
            error!(correlation = %correlation_id, error = %e, "Failed to publish position update");
        }
    }

    /// Periodic monitoring: refresh every open position's price and
    /// P&L. A gateway error on one symbol is logged and the pass
    /// continues.
    pub async fn monitoring_pass(&mut self) -> Result<()> {
        let snapshots: Vec<(String, String)> = self
            .ledger
            .open_positions()
            .iter()
            .map(|p| (p.position_id.clone(), p.symbol.clone()))
            .collect();

        if snapshots.is_empty() {
            debug!("No open positions to monitor");
            return Ok(());
        }

        for (position_id, symbol) in snapshots {
            let ticker = match self.gateway.fetch_ticker(&symbol).await {
                Ok(ticker) => ticker,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Price refresh failed; skipping position");
                    continue;
                }
            };

            if let Some(position) = self.ledger.update_price(&position_id, ticker.last) {
                self.persist_position(&position).await;
                self.publish_refresh_update(&position).await;
            }
        }
        Ok(())
    }

    async fn publish_refresh_update(&self, position: &Position) {
        let update = PositionUpdate {
            symbol: position.symbol.clone(),
            side: position.side,
            quantity: position.quantity,
            entry_price: position.entry_price,
            current_price: position.current_price,
            unrealized_pnl: position.unrealized_pnl,
            realized_pnl: position.realized_pnl,
        };
        let mut metadata = Map::new();
        metadata.insert("position_id".to_string(), json!(position.position_id));
        metadata.insert("refresh".to_string(), json!(true));

        let mut envelope = Envelope::new(self.name.clone(), Payload::Position(update));
        envelope.metadata = metadata;
        if let Err(e) = publish(
            self.bus.as_ref(),
            &self.name,
            TOPIC_POSITION,
            POSITION_PRIORITY,
            envelope,
        )
        .await
        {
            error!(symbol = %position.symbol, error = %e, "Failed to publish position refresh");
        }
    }
}

fn synthetic_rejected(request: &OrderRequest, error: &str) -> GatewayOrder {
    GatewayOrder {
        order_id: format!("rejected-{}", Uuid::new_v4()),
        symbol: request.symbol.clone(),
        side: request.side,
        order_type: request.order_type,
        status: OrderStatus::Rejected,
        quantity: request.quantity,
        filled_quantity: 0.0,
        remaining_quantity: request.quantity,
        average_price: None,
        total_cost: 0.0,
        fee: 0.0,
        fee_currency: "USDT".to_string(),
        timestamp: Utc::now(),
        error: Some(error.to_string()),
    }
}

fn position_row(position: &Position, exchange: &str) -> PositionRow {
    PositionRow {
        position_id: position.position_id.clone(),
        exchange: exchange.to_string(),
        symbol: position.symbol.clone(),
        side: position.side,
        quantity: position.quantity,
        entry_price: position.entry_price,
        current_price: position.current_price,
        unrealized_pnl: position.unrealized_pnl,
        realized_pnl: position.realized_pnl,
        stop_loss: position.stop_loss,
        take_profit: position.take_profit,
        leverage: 1.0,
        margin: 0.0,
        status: position.status,
        opened_at: position.entry_time,
        closed_at: match position.status {
            crate::domain::types::PositionStatus::Closed => Some(Utc::now()),
            _ => None,
        },
        metadata: Value::Object(position.metadata.clone()),
    }
}

async fn with_retries<T, F, Fut>(attempts: usize, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_error = None;
    for attempt in 0..attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_error = Some(e);
                if attempt + 1 < attempts {
                    let jitter = rand::rng().random_range(0..50);
                    tokio::time::sleep(
                        STORE_BACKOFF * (attempt as u32 + 1) + Duration::from_millis(jitter),
                    )
                    .await;
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("operation failed")))
}

#[async_trait]
impl Worker for ExecutionWorker {
    type Event = GatewayOrder;

    fn name(&self) -> &str {
        &self.name
    }

    fn worker_type(&self) -> &str {
        "execution"
    }

    fn config_store(&self) -> Option<Arc<dyn WorkerConfigRepository>> {
        self.config_store.clone()
    }

    async fn configure(&mut self, config: Value) -> Result<()> {
        self.apply_config(&config)
    }

    async fn setup(&mut self) -> Result<()> {
        info!(
            exchange = %self.config.exchange_id,
            testnet = self.config.testnet,
            max_slippage_pct = self.config.max_slippage_pct,
            "Execution worker initialized"
        );
        Ok(())
    }

    fn subscriptions(&self) -> Vec<String> {
        vec!["trade.order".to_string()]
    }

    async fn handle(&mut self, topic: &str, envelope: Envelope) -> Result<()> {
        match envelope.payload.clone() {
            Payload::Order(order) => self.handle_order(&envelope, order).await,
            other => {
                debug!(topic = %topic, "Ignoring unexpected payload: {:?}", other);
                Ok(())
            }
        }
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.config.monitoring_interval)
    }

    async fn tick(&mut self) -> Result<()> {
        self.monitoring_pass().await
    }

    fn take_event_source(&mut self) -> Option<mpsc::Receiver<Self::Event>> {
        self.events_rx.take()
    }

    async fn on_event(&mut self, event: Self::Event) -> Result<()> {
        self.handle_gateway_update(event).await;
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<()> {
        for monitor in &self.monitors {
            monitor.abort();
        }
        self.monitors.clear();
        Ok(())
    }
}
