//! Swarmtrade launcher - headless trading pipeline.
//!
//! Runs one worker per process in production (`fusion`, `risk`,
//! `execution`) or the whole pipeline in one process for local and
//! mock runs (`all`, the default). Workers never call each other;
//! everything flows over the message bus.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use swarmtrade::config::{BinanceConfig, Config, ExchangeMode};
use swarmtrade::domain::ports::{ExchangeGateway, MessageBus};
use swarmtrade::execution::ExecutionWorker;
use swarmtrade::fusion::FusionWorker;
use swarmtrade::infrastructure::binance::BinanceGateway;
use swarmtrade::infrastructure::bus::MemoryBus;
use swarmtrade::infrastructure::market_store::SqliteMarketStore;
use swarmtrade::infrastructure::mock::MockExchangeGateway;
use swarmtrade::infrastructure::persistence::Database;
use swarmtrade::infrastructure::persistence::repositories::{
    SqliteAssessmentRepository, SqliteDecisionRepository, SqliteOrderRepository,
    SqlitePositionRepository, SqliteSignalRepository, SqliteTradeRepository,
    SqliteWorkerConfigRepository,
};
use swarmtrade::risk::RiskWorker;
use swarmtrade::runtime::{WorkerHandle, spawn_worker};
use tokio::sync::watch;
use tracing::{Level, info};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "swarmtrade", version, about = "Multi-worker crypto trading pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the signal fusion worker only.
    Fusion,
    /// Run the risk worker only.
    Risk,
    /// Run the execution worker only.
    Execution,
    /// Run the whole pipeline in one process.
    All,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    info!("Swarmtrade {} starting...", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let config = Config::from_env()?;
    info!(
        "Configuration loaded: exchange_mode={:?}, fusion_strategy={:?}",
        config.exchange_mode, config.fusion.fusion_strategy
    );

    let database = Database::new(&config.database_url).await?;
    let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new());
    let gateway = build_gateway(&config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles: Vec<WorkerHandle> = Vec::new();

    let command = cli.command.unwrap_or(Command::All);
    let (run_fusion, run_risk, run_execution) = match command {
        Command::Fusion => (true, false, false),
        Command::Risk => (false, true, false),
        Command::Execution => (false, false, true),
        Command::All => (true, true, true),
    };

    let config_store = Arc::new(SqliteWorkerConfigRepository::new(database.pool.clone()));

    if run_fusion {
        let worker = FusionWorker::new(
            "fusion_core",
            config.fusion.clone(),
            bus.clone(),
            Arc::new(SqliteDecisionRepository::new(database.pool.clone())),
            Arc::new(SqliteSignalRepository::new(database.pool.clone())),
        )
        .with_config_store(config_store.clone());
        handles.push(spawn_worker(worker, bus.clone(), shutdown_rx.clone()));
    }

    if run_risk {
        let worker = RiskWorker::new(
            "risk_core",
            config.risk.clone(),
            bus.clone(),
            gateway.clone(),
            Arc::new(SqliteMarketStore::new(database.pool.clone())),
            Arc::new(SqliteAssessmentRepository::new(database.pool.clone())),
            Arc::new(SqlitePositionRepository::new(database.pool.clone())),
        )
        .with_config_store(config_store.clone());
        handles.push(spawn_worker(worker, bus.clone(), shutdown_rx.clone()));
    }

    if run_execution {
        let worker = ExecutionWorker::new(
            "execution_core",
            config.execution.clone(),
            bus.clone(),
            gateway.clone(),
            Arc::new(SqliteTradeRepository::new(database.pool.clone())),
            Arc::new(SqliteOrderRepository::new(database.pool.clone())),
            Arc::new(SqlitePositionRepository::new(database.pool.clone())),
        )
        .with_config_store(config_store.clone());
        handles.push(spawn_worker(worker, bus.clone(), shutdown_rx.clone()));
    }

    info!("Pipeline running with {} worker(s). Press Ctrl+C to shutdown.", handles.len());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Stopping workers...");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        match handle.task.await {
            Ok(Ok(())) => info!("Worker {} stopped cleanly", handle.name),
            Ok(Err(e)) => tracing::error!("Worker {} exited with error: {}", handle.name, e),
            Err(e) => tracing::error!("Worker {} task join failed: {}", handle.name, e),
        }
    }

    info!("Shutdown complete.");
    Ok(())
}

async fn build_gateway(config: &Config) -> Result<Arc<dyn ExchangeGateway>> {
    match config.exchange_mode {
        ExchangeMode::Mock => {
            let gateway = MockExchangeGateway::new("binance");
            // A mock account funded with the configured balance.
            gateway
                .set_balance("USDT", config.risk.account_balance)
                .await;
            Ok(Arc::new(gateway))
        }
        ExchangeMode::Binance => {
            let binance_config = BinanceConfig::from_env(config.execution.testnet)?;
            Ok(Arc::new(BinanceGateway::new(&binance_config)))
        }
    }
}
