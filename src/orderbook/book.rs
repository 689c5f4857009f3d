//! Sorted bid/ask ladders and the delta applicator
//!
//! Maintains one local book replica per (exchange, symbol) using `BTreeMap`
//! keyed by exact decimal price. Applying an update upserts or removes the
//! touched levels, truncates both sides to the depth limit, and re-checks
//! the book invariants; a crossed book is an unconditional failure surfaced
//! to the owning state machine.

use crate::exchange::{Exchange, MarketType};
use crate::orderbook::types::{BookSnapshot, BookUpdate, PriceLevel, SnapshotData};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use thiserror::Error;

/// Invariant failures produced by [`Orderbook::apply`].
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("crossed book: best_bid {best_bid} >= best_ask {best_ask}")]
    Crossed {
        best_bid: Decimal,
        best_ask: Decimal,
    },

    #[error("update {update_id} is older than book state {book_id}")]
    StaleUpdate { update_id: u64, book_id: u64 },
}

/// Local replica of one exchange orderbook.
///
/// Bids iterate best-first via `iter().rev()` (highest price first), asks via
/// `iter()` (lowest price first). All quantities stored are strictly
/// positive; the zero-quantity remove sentinel never enters the maps.
#[derive(Debug, Clone)]
pub struct Orderbook {
    pub exchange: Exchange,
    pub market_type: MarketType,
    pub symbol: String,
    pub bids: BTreeMap<Decimal, Decimal>,
    pub asks: BTreeMap<Decimal, Decimal>,
    pub last_update_id: u64,
    pub timestamp: DateTime<Utc>,
    pub depth_limit: usize,
}

impl Orderbook {
    /// Build a book from a REST snapshot.
    pub fn from_snapshot(
        exchange: Exchange,
        market_type: MarketType,
        symbol: impl Into<String>,
        snapshot: &SnapshotData,
        depth_limit: usize,
    ) -> Self {
        let mut book = Self {
            exchange,
            market_type,
            symbol: symbol.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: snapshot.last_update_id,
            timestamp: snapshot.event_time,
            depth_limit,
        };
        for level in &snapshot.bids {
            if !level.quantity.is_zero() {
                book.bids.insert(level.price, level.quantity);
            }
        }
        for level in &snapshot.asks {
            if !level.quantity.is_zero() {
                book.asks.insert(level.price, level.quantity);
            }
        }
        book.truncate();
        book
    }

    /// Highest bid price.
    pub fn best_bid(&self) -> Option<&Decimal> {
        self.bids.keys().next_back()
    }

    /// Lowest ask price.
    pub fn best_ask(&self) -> Option<&Decimal> {
        self.asks.keys().next()
    }

    /// Apply one validated incremental update.
    ///
    /// Sequence continuity is the caller's responsibility; this only enforces
    /// book-shape invariants. A removal for an absent price is a no-op, per
    /// exchange semantics. On success `last_update_id` and `timestamp`
    /// advance to the update's values.
    pub fn apply(&mut self, update: &BookUpdate) -> Result<(), ApplyError> {
        if update.last_update_id < self.last_update_id {
            return Err(ApplyError::StaleUpdate {
                update_id: update.last_update_id,
                book_id: self.last_update_id,
            });
        }

        for level in &update.bids {
            Self::upsert(&mut self.bids, level);
        }
        for level in &update.asks {
            Self::upsert(&mut self.asks, level);
        }

        self.truncate();

        if let (Some(&best_bid), Some(&best_ask)) = (self.best_bid(), self.best_ask()) {
            if best_bid >= best_ask {
                return Err(ApplyError::Crossed { best_bid, best_ask });
            }
        }

        self.last_update_id = update.last_update_id;
        self.timestamp = update.event_time;
        Ok(())
    }

    fn upsert(side: &mut BTreeMap<Decimal, Decimal>, level: &PriceLevel) {
        if level.quantity.is_zero() {
            side.remove(&level.price);
        } else {
            // Remove first: `insert` keeps the existing key, and equal
            // decimals can differ in scale ("100" vs "100.0"). Emitted
            // strings and the OKX checksum must carry the latest quote.
            side.remove(&level.price);
            side.insert(level.price, level.quantity);
        }
    }

    /// Drop levels beyond `depth_limit` on each side: lowest bids, highest
    /// asks.
    fn truncate(&mut self) {
        while self.bids.len() > self.depth_limit {
            self.bids.pop_first();
        }
        while self.asks.len() > self.depth_limit {
            self.asks.pop_last();
        }
    }

    /// Produce the normalized outbound snapshot: decimal strings, bids
    /// descending, asks ascending, both capped at `depth_limit`.
    pub fn to_emit(&self) -> BookSnapshot {
        BookSnapshot {
            exchange: self.exchange.venue(),
            market_type: self.market_type,
            symbol: self.symbol.clone(),
            timestamp: self.timestamp,
            last_update_id: self.last_update_id,
            bids: self
                .bids
                .iter()
                .rev()
                .take(self.depth_limit)
                .map(|(p, q)| [p.to_string(), q.to_string()])
                .collect(),
            asks: self
                .asks
                .iter()
                .take(self.depth_limit)
                .map(|(p, q)| [p.to_string(), q.to_string()])
                .collect(),
        }
    }
}
