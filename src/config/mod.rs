//! Configuration, loaded from environment variables.
//!
//! Each worker family has its own struct so a process can load only
//! what it runs. Invalid values are startup-time fatals: `from_env`
//! bails instead of falling back silently.

use crate::fusion::policy::FusionStrategy;
use crate::risk::sizing::SizingMethod;
use crate::risk::stops::StopMethod;
use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env_or(key, default);
    raw.parse::<T>()
        .map_err(|e| anyhow::anyhow!("Invalid {}: '{}' ({})", key, raw, e))
}

/// Which exchange adapter to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeMode {
    Mock,
    Binance,
}

impl FromStr for ExchangeMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mock" => Ok(ExchangeMode::Mock),
            "binance" => Ok(ExchangeMode::Binance),
            _ => anyhow::bail!("Invalid EXCHANGE_MODE: {}. Must be 'mock' or 'binance'", s),
        }
    }
}

/// Signal fusion worker configuration.
#[derive(Debug, Clone)]
pub struct FusionConfig {
    pub fusion_strategy: FusionStrategy,
    pub min_signals: usize,
    pub signal_timeout: Duration,
    pub min_confidence: f64,
    pub decision_interval: Duration,
}

impl FusionConfig {
    pub fn from_env() -> Result<Self> {
        let strategy = env_or("FUSION_STRATEGY", "hybrid");
        let config = Self {
            fusion_strategy: strategy
                .parse()
                .context("Failed to parse FUSION_STRATEGY")?,
            min_signals: parse_env("FUSION_MIN_SIGNALS", "2")?,
            signal_timeout: Duration::from_secs(parse_env("FUSION_SIGNAL_TIMEOUT_SECONDS", "300")?),
            min_confidence: parse_env("FUSION_MIN_CONFIDENCE", "0.6")?,
            decision_interval: Duration::from_secs(parse_env(
                "FUSION_DECISION_INTERVAL_SECONDS",
                "30",
            )?),
        };
        if !(0.0..=1.0).contains(&config.min_confidence) {
            anyhow::bail!(
                "FUSION_MIN_CONFIDENCE must be within [0, 1], got {}",
                config.min_confidence
            );
        }
        if config.min_signals == 0 {
            anyhow::bail!("FUSION_MIN_SIGNALS must be at least 1");
        }
        Ok(config)
    }
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            fusion_strategy: FusionStrategy::Hybrid,
            min_signals: 2,
            signal_timeout: Duration::from_secs(300),
            min_confidence: 0.6,
            decision_interval: Duration::from_secs(30),
        }
    }
}

/// Risk worker configuration.
#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub account_balance: f64,
    pub max_portfolio_risk: f64,
    pub max_position_risk: f64,
    pub position_sizing_method: SizingMethod,
    pub stop_loss_method: StopMethod,
    pub min_confidence: f64,
    pub min_rr_ratio: f64,
    /// Last-resort price when neither the intent nor the time-series
    /// store has one. Zero rejects the intent instead.
    pub price_fallback: f64,
}

impl RiskConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            account_balance: parse_env("RISK_ACCOUNT_BALANCE", "10000.0")?,
            max_portfolio_risk: parse_env("RISK_MAX_PORTFOLIO_RISK", "0.20")?,
            max_position_risk: parse_env("RISK_MAX_POSITION_RISK", "0.05")?,
            position_sizing_method: env_or("RISK_POSITION_SIZING_METHOD", "hybrid")
                .parse()
                .context("Failed to parse RISK_POSITION_SIZING_METHOD")?,
            stop_loss_method: env_or("RISK_STOP_LOSS_METHOD", "atr")
                .parse()
                .context("Failed to parse RISK_STOP_LOSS_METHOD")?,
            min_confidence: parse_env("RISK_MIN_CONFIDENCE", "0.6")?,
            min_rr_ratio: parse_env("RISK_MIN_RR_RATIO", "1.5")?,
            price_fallback: parse_env("RISK_PRICE_FALLBACK", "0.0")?,
        };
        if config.account_balance < 0.0 {
            anyhow::bail!("RISK_ACCOUNT_BALANCE must be non-negative");
        }
        if !(0.0..=1.0).contains(&config.max_portfolio_risk) {
            anyhow::bail!("RISK_MAX_PORTFOLIO_RISK must be within [0, 1]");
        }
        Ok(config)
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            account_balance: 10000.0,
            max_portfolio_risk: 0.20,
            max_position_risk: 0.05,
            position_sizing_method: SizingMethod::Hybrid,
            stop_loss_method: StopMethod::Atr,
            min_confidence: 0.6,
            min_rr_ratio: 1.5,
            price_fallback: 0.0,
        }
    }
}

/// Execution worker configuration.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub exchange_id: String,
    pub testnet: bool,
    pub max_slippage_pct: f64,
    pub monitoring_interval: Duration,
}

impl ExecutionConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            exchange_id: env_or("EXECUTION_EXCHANGE_ID", "binance"),
            testnet: parse_env("EXECUTION_TESTNET", "true")?,
            max_slippage_pct: parse_env("EXECUTION_MAX_SLIPPAGE_PCT", "1.0")?,
            monitoring_interval: Duration::from_secs(parse_env(
                "EXECUTION_MONITORING_INTERVAL_SECONDS",
                "10",
            )?),
        })
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            exchange_id: "binance".to_string(),
            testnet: true,
            max_slippage_pct: 1.0,
            monitoring_interval: Duration::from_secs(10),
        }
    }
}

/// Binance REST/WebSocket credentials and endpoints.
#[derive(Debug, Clone)]
pub struct BinanceConfig {
    pub api_key: String,
    pub api_secret: String,
    pub base_url: String,
    pub ws_url: String,
}

impl BinanceConfig {
    pub fn from_env(testnet: bool) -> Result<Self> {
        let (default_base, default_ws) = if testnet {
            ("https://testnet.binance.vision", "wss://stream.testnet.binance.vision")
        } else {
            ("https://api.binance.com", "wss://stream.binance.com:9443")
        };

        let config = Self {
            api_key: env_or("BINANCE_API_KEY", ""),
            api_secret: env_or("BINANCE_SECRET_KEY", ""),
            base_url: env_or("BINANCE_BASE_URL", default_base),
            ws_url: env_or("BINANCE_WS_URL", default_ws),
        };

        if !testnet && (config.api_key.is_empty() || config.api_secret.is_empty()) {
            anyhow::bail!("BINANCE_API_KEY and BINANCE_SECRET_KEY are required in live mode");
        }
        Ok(config)
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub exchange_mode: ExchangeMode,
    pub database_url: String,
    pub fusion: FusionConfig,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            exchange_mode: env_or("EXCHANGE_MODE", "mock")
                .parse()
                .context("Failed to parse EXCHANGE_MODE")?,
            database_url: env_or("DATABASE_URL", "sqlite://data/swarmtrade.db"),
            fusion: FusionConfig::from_env()?,
            risk: RiskConfig::from_env()?,
            execution: ExecutionConfig::from_env()?,
        })
    }
}
