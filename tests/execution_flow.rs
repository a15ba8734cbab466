//! Execution-core scenarios: slippage accounting on a poor fill and
//! redelivery collapse after an order has completed.

use serde_json::{Map, json};
use std::sync::Arc;
use swarmtrade::config::ExecutionConfig;
use swarmtrade::domain::messages::{Envelope, OrderRequest, Payload};
use swarmtrade::domain::types::{OrderType, Side};
use swarmtrade::execution::ExecutionWorker;
use swarmtrade::infrastructure::bus::MemoryBus;
use swarmtrade::infrastructure::mock::{
    FillBehavior, MockExchangeGateway, MockOrderRepository, MockPositionRepository,
    MockTradeRepository,
};
use swarmtrade::domain::repositories::OrderRepository;
use swarmtrade::runtime::Worker;

fn order_envelope(expected_price: f64, quantity: f64) -> Envelope {
    let mut risk_params = Map::new();
    risk_params.insert("expected_price".to_string(), json!(expected_price));
    Envelope::new(
        "risk_core",
        Payload::Order(OrderRequest {
            exchange: "binance".to_string(),
            symbol: "BTC/USDT".to_string(),
            side: Side::Buy,
            order_type: OrderType::Market,
            quantity,
            price: None,
            stop_loss: Some(48000.0),
            take_profit: Some(54000.0),
            leverage: 1.0,
            risk_approved: true,
            risk_params,
        }),
    )
    .with_correlation(uuid::Uuid::new_v4().to_string())
}

struct Fixture {
    worker: ExecutionWorker,
    gateway: Arc<MockExchangeGateway>,
    trades: Arc<MockTradeRepository>,
    orders: Arc<MockOrderRepository>,
}

async fn fixture() -> Fixture {
    let bus = Arc::new(MemoryBus::new());
    let gateway = Arc::new(MockExchangeGateway::new("binance"));
    let trades = Arc::new(MockTradeRepository::default());
    let orders = Arc::new(MockOrderRepository::default());
    let positions = Arc::new(MockPositionRepository::default());

    let worker = ExecutionWorker::new(
        "execution_core",
        ExecutionConfig::default(),
        bus,
        gateway.clone(),
        trades.clone(),
        orders.clone(),
        positions,
    );
    Fixture {
        worker,
        gateway,
        trades,
        orders,
    }
}

#[tokio::test]
async fn test_poor_fill_records_slippage_metrics() {
    let mut fx = fixture().await;
    // Expected 50000, filled 50600: +1.2% slippage on a BUY.
    fx.gateway
        .set_fill_behavior(FillBehavior::FillAt(50600.0))
        .await;

    let envelope = order_envelope(50000.0, 0.1);
    fx.worker.handle("trade.order", envelope).await.unwrap();

    let rows = fx.trades.all().await;
    assert_eq!(rows.len(), 1);
    let metadata = &rows[0].metadata;
    assert!((metadata["slippage_pct"].as_f64().unwrap() - 1.2).abs() < 1e-9);
    assert_eq!(metadata["quality_rating"].as_str().unwrap(), "very_poor");
    // 0.5 * slip(18) + 0.3 * cost + 0.2 * speed(100) stays at or
    // below 60 for a very poor fill.
    assert!(metadata["quality_score"].as_f64().unwrap() <= 60.0);
}

#[tokio::test]
async fn test_fill_exactly_at_slippage_limit() {
    let mut fx = fixture().await;
    // Exactly 1.0%: the strictly-below band edge tips the rating to
    // very_poor, while the warning comparison (strictly greater than
    // the limit) does not fire.
    fx.gateway
        .set_fill_behavior(FillBehavior::FillAt(50500.0))
        .await;

    let envelope = order_envelope(50000.0, 0.1);
    fx.worker.handle("trade.order", envelope).await.unwrap();

    let rows = fx.trades.all().await;
    assert_eq!(rows.len(), 1);
    let metadata = &rows[0].metadata;
    assert!((metadata["slippage_pct"].as_f64().unwrap() - 1.0).abs() < 1e-9);
    assert_eq!(metadata["quality_rating"].as_str().unwrap(), "very_poor");
}

#[tokio::test]
async fn test_completed_order_redelivery_is_collapsed() {
    let mut fx = fixture().await;
    fx.gateway
        .set_fill_behavior(FillBehavior::FillAt(50000.0))
        .await;

    let envelope = order_envelope(50000.0, 0.1);
    fx.worker.handle("trade.order", envelope.clone()).await.unwrap();
    assert_eq!(fx.gateway.created_order_count().await, 1);

    // The order is done and out of the pending registry; the store
    // row carries its terminal status, so the redelivery stops there.
    fx.worker.handle("trade.order", envelope.clone()).await.unwrap();
    assert_eq!(fx.gateway.created_order_count().await, 1);
    assert_eq!(fx.trades.count().await, 1);

    // The position was neither doubled nor resurrected.
    let position = fx
        .worker
        .ledger()
        .position_for_symbol("BTC/USDT")
        .expect("position expected");
    assert!((position.quantity - 0.1).abs() < 1e-12);

    let order_row = fx
        .orders
        .find(envelope.correlation_id.as_deref().unwrap())
        .await
        .unwrap()
        .expect("order row expected");
    assert!(order_row.status.is_terminal());
}

#[tokio::test]
async fn test_conditional_orders_are_not_monitored_as_entries() {
    let mut fx = fixture().await;
    fx.gateway
        .set_fill_behavior(FillBehavior::FillAt(50000.0))
        .await;

    let envelope = order_envelope(50000.0, 0.1);
    fx.worker.handle("trade.order", envelope).await.unwrap();

    // Entry completed; the protective orders exist on the exchange
    // but the pending registry is empty.
    assert_eq!(fx.gateway.placed_conditionals().await.len(), 2);
    assert_eq!(fx.worker.pending_count(), 0);
}
