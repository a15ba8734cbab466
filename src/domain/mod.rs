pub mod errors;
pub mod messages;
pub mod ports;
pub mod repositories;
pub mod types;
