//! Execution Core: dispatches orders to the exchange, reconciles
//! fills, maintains positions with live P&L, and reports execution
//! quality.

pub mod ledger;
pub mod quality;
mod worker;

pub use worker::ExecutionWorker;
