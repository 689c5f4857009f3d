//! Canonical orderbook message envelopes and per-symbol status types
//!
//! Everything downstream of the decoder speaks these types: the incremental
//! [`BookUpdate`], the normalized [`BookSnapshot`] emitted to the publisher,
//! and the per-symbol lifecycle/health records surfaced to the operator
//! endpoint.

use crate::exchange::{Exchange, MarketType};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// One price level carried in an update. `quantity == 0` is the remove
/// sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }
}

/// A decoded incremental depth update in canonical form.
///
/// Field mapping per exchange:
///
/// | field           | Binance spot | Binance deriv | OKX         | Deribit          |
/// |-----------------|--------------|---------------|-------------|------------------|
/// | first_update_id | `U`          | `U`           | `seqId`     | `change_id`      |
/// | last_update_id  | `u`          | `u`           | `seqId`     | `change_id`      |
/// | prev_update_id  | —            | `pu`          | `prevSeqId` | `prev_change_id` |
/// | checksum        | —            | —             | `checksum`  | —                |
/// | event_time      | `E`          | `E`           | `ts`        | `timestamp`      |
#[derive(Debug, Clone, PartialEq)]
pub struct BookUpdate {
    pub exchange: Exchange,
    /// Canonical symbol, e.g. `BTC-USDT`.
    pub symbol: String,
    pub market_type: MarketType,
    pub first_update_id: u64,
    pub last_update_id: u64,
    /// Explicit previous-id continuity field where the exchange provides one.
    /// OKX `prevSeqId = -1` (snapshot frames) maps to `None`.
    pub prev_update_id: Option<u64>,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    /// OKX CRC32 over the post-state top-25 levels.
    pub checksum: Option<i32>,
    pub event_time: DateTime<Utc>,
}

/// A full depth snapshot as returned by the snapshot client, already in
/// canonical decimal form.
#[derive(Debug, Clone)]
pub struct SnapshotData {
    pub last_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    /// OKX snapshots carry the checksum of their own top-25 state.
    pub checksum: Option<i32>,
    pub event_time: DateTime<Utc>,
}

/// Normalized orderbook emitted after every applied update.
///
/// This is the canonical outbound payload: prices and quantities as decimal
/// strings, bids descending, asks ascending, truncated to the configured
/// depth limit. `timestamp` serializes as ISO-8601 UTC.
#[derive(Debug, Clone, Serialize)]
pub struct BookSnapshot {
    pub exchange: &'static str,
    pub market_type: MarketType,
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub last_update_id: u64,
    pub bids: Vec<[String; 2]>,
    pub asks: Vec<[String; 2]>,
}

impl BookSnapshot {
    /// Outbound subject: `orderbook.{exchange}.{market_type}.{symbol}`.
    pub fn subject(&self) -> String {
        format!(
            "orderbook.{}.{}.{}",
            self.exchange, self.market_type, self.symbol
        )
    }
}

/// Lifecycle phase of one symbol's synchronization state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    AwaitSnapshot,
    Syncing,
    Ready,
    Resync,
    Failed,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::AwaitSnapshot => "await_snapshot",
            SyncPhase::Syncing => "syncing",
            SyncPhase::Ready => "ready",
            SyncPhase::Resync => "resync",
            SyncPhase::Failed => "failed",
        }
    }
}

/// Per-symbol counters, shared between the owning worker (writer) and the
/// manager's status surface (reader).
#[derive(Debug, Default)]
pub struct SymbolCounters {
    pub updates_applied: AtomicU64,
    pub gaps_detected: AtomicU64,
    pub resyncs: AtomicU64,
    pub checksum_failures: AtomicU64,
    pub buffer_overflows: AtomicU64,
    pub buffer_high_watermark: AtomicU64,
    /// Binance-derivatives continuity accepted via `pu == previous_u`.
    pub pu_matches: AtomicU64,
    /// Binance-derivatives continuity accepted via the overlap rule.
    pub overlap_accepts: AtomicU64,
}

impl SymbolCounters {
    pub fn record_buffer_depth(&self, depth: u64) {
        self.buffer_high_watermark.fetch_max(depth, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            updates_applied: self.updates_applied.load(Ordering::Relaxed),
            gaps_detected: self.gaps_detected.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            buffer_overflows: self.buffer_overflows.load(Ordering::Relaxed),
            buffer_high_watermark: self.buffer_high_watermark.load(Ordering::Relaxed),
            pu_matches: self.pu_matches.load(Ordering::Relaxed),
            overlap_accepts: self.overlap_accepts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SymbolCounters`] for status responses.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CounterSnapshot {
    pub updates_applied: u64,
    pub gaps_detected: u64,
    pub resyncs: u64,
    pub checksum_failures: u64,
    pub buffer_overflows: u64,
    pub buffer_high_watermark: u64,
    pub pu_matches: u64,
    pub overlap_accepts: u64,
}

/// Per-symbol row of the operator health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolHealth {
    pub exchange: Exchange,
    pub symbol: String,
    pub phase: SyncPhase,
    pub last_update_id: u64,
    pub updates_applied: u64,
    pub gaps_detected: u64,
    pub resyncs: u64,
    pub buffer_size: u64,
    pub last_event_time: Option<DateTime<Utc>>,
}

/// Aggregate health of the whole fleet.
#[derive(Debug, Clone, Serialize)]
pub struct FleetHealth {
    pub status: HealthStatus,
    pub symbols_total: usize,
    pub symbols_ready: usize,
    pub symbols_failed: usize,
    /// Malformed frames dropped per exchange stream.
    pub stream_decode_errors: HashMap<Exchange, u64>,
    pub symbols: Vec<SymbolHealth>,
}

/// Health status levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All tracked symbols are READY (or none are tracked).
    Ok,
    /// Some symbols are syncing or resyncing.
    Degraded,
    /// At least one symbol is FAILED.
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_fixture() -> BookSnapshot {
        BookSnapshot {
            exchange: "binance",
            market_type: MarketType::Spot,
            symbol: "BTC-USDT".to_string(),
            timestamp: DateTime::from_timestamp_millis(1_700_000_000_123).unwrap(),
            last_update_id: 42,
            bids: vec![["100.5".to_string(), "1.2".to_string()]],
            asks: vec![["100.6".to_string(), "0.8".to_string()]],
        }
    }

    #[test]
    fn test_subject_format() {
        assert_eq!(
            snapshot_fixture().subject(),
            "orderbook.binance.spot.BTC-USDT"
        );
    }

    #[test]
    fn test_canonical_payload_shape() {
        let json = serde_json::to_value(snapshot_fixture()).unwrap();
        assert_eq!(json["exchange"], "binance");
        assert_eq!(json["market_type"], "spot");
        assert_eq!(json["symbol"], "BTC-USDT");
        assert_eq!(json["last_update_id"], 42);
        assert_eq!(json["bids"][0][0], "100.5");
        // chrono serializes DateTime<Utc> as ISO-8601 / RFC 3339
        assert!(json["timestamp"].as_str().unwrap().starts_with("2023-"));
    }

    #[test]
    fn test_counter_high_watermark() {
        let counters = SymbolCounters::default();
        counters.record_buffer_depth(5);
        counters.record_buffer_depth(3);
        assert_eq!(counters.snapshot().buffer_high_watermark, 5);
    }
}
