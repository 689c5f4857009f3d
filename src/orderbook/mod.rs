//! Per-symbol orderbook maintenance
//!
//! The synchronization core: exchange payload decoding, snapshot bootstrap,
//! sequence validation, ladder maintenance with checksum verification, and
//! the per-symbol state machines coordinated by [`OrderbookManager`].
//!
//! Data flow: raw WS frame -> [`decoder`] -> manager routes by symbol ->
//! [`sync::SymbolSync`] validates sequence -> [`book::Orderbook`] mutates the
//! ladder -> normalized snapshot emitted through [`publisher`].

pub mod book;
pub mod checksum;
pub mod decoder;
pub mod manager;
pub mod publisher;
pub mod rate_limiter;
pub mod sequence;
pub mod snapshot;
pub mod sync;
pub mod types;
pub mod websocket;
pub mod worker;

pub use book::Orderbook;
pub use manager::{OrderbookManager, SymbolStatsView};
pub use publisher::{BookPublisher, OrderbookSink, TraceSink};
pub use rate_limiter::WeightLimiter;
pub use snapshot::{RestSnapshotClient, SnapshotProvider};
pub use sync::SymbolSync;
pub use types::{BookSnapshot, BookUpdate, FleetHealth, PriceLevel, SnapshotData, SyncPhase};
