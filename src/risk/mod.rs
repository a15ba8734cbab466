//! Risk Core: sizes positions, places protective levels, validates
//! portfolio-wide risk, and turns approved intents into orders.

pub mod assessment;
pub mod sizing;
pub mod stops;
mod worker;

pub use worker::RiskWorker;
