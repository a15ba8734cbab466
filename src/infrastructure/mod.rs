pub mod binance;
pub mod bus;
pub mod market_store;
pub mod mock;
pub mod persistence;
