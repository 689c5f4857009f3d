// Library exports for depthsync

pub mod config; // Configuration management
pub mod error;
pub mod exchange; // Exchange taxonomy and symbol normalization
pub mod orderbook; // Per-symbol orderbook synchronization core

pub use config::AppConfig;
pub use error::{Error, Result};
pub use exchange::{BookKey, Exchange, MarketType};
pub use orderbook::OrderbookManager;
