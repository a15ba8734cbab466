//! Signal Fusion Core: buffers heterogeneous signals per symbol and
//! periodically fuses them into trade intents.

pub mod buffer;
pub mod policy;
mod worker;

pub use worker::FusionWorker;
