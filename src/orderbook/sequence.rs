//! Exchange-specific sequence continuity validation
//!
//! Each exchange documents its own rules for stitching incremental depth
//! updates onto a snapshot. The [`Sequencer`] tracks the last applied update
//! id for one symbol and classifies every incoming update as stale (drop),
//! applicable, or a gap (forces resynchronization).
//!
//! Rules implemented:
//!
//! - **Binance spot**: drop `u <= S`; first applied update must straddle the
//!   snapshot (`U <= S+1 <= u`); afterwards `U == previous_u + 1`.
//! - **Binance derivatives**: same snapshot straddle; afterwards continuity
//!   via `pu == previous_u`, with an additional overlap acceptance when
//!   `U <= previous_u < u` — observed exchange behavior restates older ids
//!   without implying loss.
//! - **OKX**: drop `seqId <= S`; first applied update must have
//!   `prevSeqId <= S` (REST snapshots interleave with the sequence chain);
//!   afterwards `prevSeqId == previous_seqId` exactly.
//! - **Deribit**: `prev_change_id == previous change_id` throughout; REST
//!   snapshots share the `change_id` space with the stream.

use crate::exchange::Exchange;
use crate::orderbook::types::BookUpdate;
use thiserror::Error;

/// How an applicable update satisfied the continuity rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuity {
    /// First update applied after a snapshot.
    First,
    /// Plain incremental continuity (`U == previous_u + 1` or exact
    /// prev-id match).
    Incremental,
    /// Binance derivatives `pu == previous_u`.
    PuMatch,
    /// Binance derivatives overlap rule (`U <= previous_u < u`).
    Overlap,
}

/// Outcome of validating one update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqDecision {
    /// Apply the update; `last_update_id` has advanced.
    Apply(Continuity),
    /// Already covered by the current book state; drop silently.
    Stale,
}

/// Sequence discontinuity: data was lost and the book must be rebuilt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error(
    "sequence gap: expected continuation of {expected}, got U={first_update_id} u={last_update_id} prev={prev_update_id:?}"
)]
pub struct SequenceGap {
    pub expected: u64,
    pub first_update_id: u64,
    pub last_update_id: u64,
    pub prev_update_id: Option<u64>,
}

/// Per-symbol sequence tracker, created fresh from each snapshot.
#[derive(Debug, Clone)]
pub struct Sequencer {
    exchange: Exchange,
    last_update_id: u64,
    updates_processed: u64,
}

impl Sequencer {
    /// Start tracking from a snapshot's update id.
    pub fn new(exchange: Exchange, snapshot_update_id: u64) -> Self {
        Self {
            exchange,
            last_update_id: snapshot_update_id,
            updates_processed: 0,
        }
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    fn is_first_update(&self) -> bool {
        self.updates_processed == 0
    }

    /// Classify `update` against the current position. On `Apply` the
    /// tracker advances to the update's `last_update_id`.
    pub fn validate(&mut self, update: &BookUpdate) -> Result<SeqDecision, SequenceGap> {
        if update.last_update_id <= self.last_update_id {
            return Ok(SeqDecision::Stale);
        }

        let continuity = match self.exchange {
            Exchange::BinanceSpot => self.validate_binance_spot(update)?,
            Exchange::BinanceFutures => self.validate_binance_futures(update)?,
            Exchange::OkxSpot | Exchange::OkxSwap => self.validate_prev_chained(update, true)?,
            Exchange::Deribit => self.validate_prev_chained(update, false)?,
        };

        self.updates_processed += 1;
        self.last_update_id = update.last_update_id;
        Ok(SeqDecision::Apply(continuity))
    }

    fn gap(&self, update: &BookUpdate) -> SequenceGap {
        SequenceGap {
            expected: self.last_update_id,
            first_update_id: update.first_update_id,
            last_update_id: update.last_update_id,
            prev_update_id: update.prev_update_id,
        }
    }

    fn validate_binance_spot(&self, update: &BookUpdate) -> Result<Continuity, SequenceGap> {
        if self.is_first_update() {
            // U <= S+1 <= u
            if update.first_update_id <= self.last_update_id + 1 {
                Ok(Continuity::First)
            } else {
                Err(self.gap(update))
            }
        } else if update.first_update_id == self.last_update_id + 1 {
            Ok(Continuity::Incremental)
        } else {
            Err(self.gap(update))
        }
    }

    fn validate_binance_futures(&self, update: &BookUpdate) -> Result<Continuity, SequenceGap> {
        if self.is_first_update() {
            if update.first_update_id <= self.last_update_id + 1 {
                Ok(Continuity::First)
            } else {
                Err(self.gap(update))
            }
        } else if update.prev_update_id == Some(self.last_update_id) {
            Ok(Continuity::PuMatch)
        } else if update.first_update_id <= self.last_update_id {
            // Overlap-valid: the range restates already-applied ids and
            // extends past them (u > previous_u holds, the stale check ran).
            Ok(Continuity::Overlap)
        } else {
            Err(self.gap(update))
        }
    }

    /// OKX and Deribit chain updates through an explicit previous-id field.
    /// `straddle_first` relaxes the first post-snapshot update to
    /// `prev <= snapshot_id` for exchanges whose REST snapshots interleave
    /// with the stream sequence.
    fn validate_prev_chained(
        &self,
        update: &BookUpdate,
        straddle_first: bool,
    ) -> Result<Continuity, SequenceGap> {
        let Some(prev) = update.prev_update_id else {
            return Err(self.gap(update));
        };

        if self.is_first_update() {
            let aligned = if straddle_first {
                prev <= self.last_update_id
            } else {
                prev == self.last_update_id
            };
            if aligned {
                Ok(Continuity::First)
            } else {
                Err(self.gap(update))
            }
        } else if prev == self.last_update_id {
            Ok(Continuity::Incremental)
        } else {
            Err(self.gap(update))
        }
    }
}
