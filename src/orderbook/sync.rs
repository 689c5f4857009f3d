//! Per-symbol synchronization state machine
//!
//! Owns the lifecycle of one (exchange, symbol) book replica:
//!
//! ```text
//! IDLE -> AWAIT_SNAPSHOT -> SYNCING -> READY
//!              ^                         |
//!              |      RESYNC <-----------+  (gap / checksum / crossed)
//!              +--------+
//! ```
//!
//! The machine is pure: it consumes updates and snapshots, mutates its own
//! book, and returns [`SyncAction`]s for the async worker to execute
//! (publish, request a snapshot, schedule a resync, give up). All I/O and
//! timing lives in the worker; everything here is deterministic and tested
//! without a runtime.

use crate::exchange::{Exchange, MarketType};
use crate::orderbook::book::{ApplyError, Orderbook};
use crate::orderbook::checksum::okx_book_checksum;
use crate::orderbook::sequence::{Continuity, SeqDecision, Sequencer};
use crate::orderbook::types::{BookSnapshot, BookUpdate, SnapshotData, SymbolCounters, SyncPhase};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why a resynchronization was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncReason {
    Gap,
    ChecksumMismatch,
    CrossedBook,
    AlignmentImpossible,
}

impl ResyncReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResyncReason::Gap => "gap",
            ResyncReason::ChecksumMismatch => "checksum_mismatch",
            ResyncReason::CrossedBook => "crossed_book",
            ResyncReason::AlignmentImpossible => "alignment_impossible",
        }
    }
}

/// Instruction to the owning worker.
#[derive(Debug, Clone)]
pub enum SyncAction {
    /// Publish this normalized book downstream.
    Emit(BookSnapshot),
    /// Fetch a fresh snapshot (entering AWAIT_SNAPSHOT).
    RequestSnapshot,
    /// Wait the resync delay, then call [`SymbolSync::on_resync_timer`].
    ScheduleResync(ResyncReason),
}

/// The per-symbol state machine. Single-writer: only the owning worker task
/// calls these methods.
pub struct SymbolSync {
    exchange: Exchange,
    symbol: String,
    market_type: MarketType,
    depth_limit: usize,
    buffer_limit: usize,
    phase: SyncPhase,
    buffer: VecDeque<BookUpdate>,
    book: Option<Orderbook>,
    sequencer: Option<Sequencer>,
    counters: Arc<SymbolCounters>,
}

impl SymbolSync {
    pub fn new(
        exchange: Exchange,
        symbol: impl Into<String>,
        market_type: MarketType,
        depth_limit: usize,
        buffer_limit: usize,
        counters: Arc<SymbolCounters>,
    ) -> Self {
        Self {
            exchange,
            symbol: symbol.into(),
            market_type,
            depth_limit,
            buffer_limit,
            phase: SyncPhase::Idle,
            buffer: VecDeque::new(),
            book: None,
            sequencer: None,
            counters,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn last_update_id(&self) -> u64 {
        self.book.as_ref().map(|b| b.last_update_id).unwrap_or(0)
    }

    /// Current book, if synchronized.
    pub fn book(&self) -> Option<&Orderbook> {
        self.book.as_ref()
    }

    /// IDLE -> AWAIT_SNAPSHOT on first subscription.
    pub fn on_subscribe(&mut self) -> Vec<SyncAction> {
        debug_assert_eq!(self.phase, SyncPhase::Idle);
        info!(exchange = %self.exchange, symbol = %self.symbol, "subscribing");
        self.phase = SyncPhase::AwaitSnapshot;
        vec![SyncAction::RequestSnapshot]
    }

    /// Feed one decoded update.
    pub fn on_update(&mut self, update: BookUpdate) -> Vec<SyncAction> {
        match self.phase {
            SyncPhase::AwaitSnapshot | SyncPhase::Resync => {
                self.buffer_update(update);
                vec![]
            }
            SyncPhase::Ready => self.apply_live(update),
            // Dropped: IDLE has no subscription, FAILED awaits the operator,
            // and SYNCING is never observable between calls.
            SyncPhase::Idle | SyncPhase::Syncing | SyncPhase::Failed => vec![],
        }
    }

    /// Install a fetched snapshot and drain the buffer (AWAIT_SNAPSHOT ->
    /// SYNCING -> READY, or back to RESYNC when alignment fails).
    pub fn on_snapshot(&mut self, snapshot: SnapshotData) -> Vec<SyncAction> {
        if self.phase != SyncPhase::AwaitSnapshot {
            warn!(
                exchange = %self.exchange,
                symbol = %self.symbol,
                phase = self.phase.as_str(),
                "snapshot arrived outside AWAIT_SNAPSHOT, ignoring"
            );
            return vec![];
        }

        self.phase = SyncPhase::Syncing;
        self.book = Some(Orderbook::from_snapshot(
            self.exchange,
            self.market_type,
            self.symbol.clone(),
            &snapshot,
            self.depth_limit,
        ));
        self.sequencer = Some(Sequencer::new(self.exchange, snapshot.last_update_id));

        let buffered: Vec<BookUpdate> = self.buffer.drain(..).collect();
        let buffered_count = buffered.len();
        for update in buffered {
            match self.validate_and_apply(&update) {
                Ok(_) => {}
                Err(reason) => {
                    // Alignment failed: discard the snapshot and try again.
                    warn!(
                        exchange = %self.exchange,
                        symbol = %self.symbol,
                        reason = reason.as_str(),
                        "buffer drain failed, discarding snapshot"
                    );
                    return self.enter_resync(ResyncReason::AlignmentImpossible);
                }
            }
        }

        self.phase = SyncPhase::Ready;
        let book = self.book.as_ref().expect("book installed above");
        info!(
            exchange = %self.exchange,
            symbol = %self.symbol,
            snapshot_update_id = snapshot.last_update_id,
            last_update_id = book.last_update_id,
            drained = buffered_count,
            "book synchronized"
        );
        vec![SyncAction::Emit(book.to_emit())]
    }

    /// The snapshot request failed terminally for this round; stay in
    /// AWAIT_SNAPSHOT and ask again (the worker paces the retry).
    pub fn on_snapshot_unavailable(&mut self) -> Vec<SyncAction> {
        debug_assert_eq!(self.phase, SyncPhase::AwaitSnapshot);
        vec![SyncAction::RequestSnapshot]
    }

    /// RESYNC -> AWAIT_SNAPSHOT once the retry delay has elapsed.
    pub fn on_resync_timer(&mut self) -> Vec<SyncAction> {
        debug_assert_eq!(self.phase, SyncPhase::Resync);
        self.phase = SyncPhase::AwaitSnapshot;
        vec![SyncAction::RequestSnapshot]
    }

    /// Terminal failure after bounded retries; the symbol stays visible in
    /// health output until an operator intervenes.
    pub fn fail(&mut self) {
        warn!(exchange = %self.exchange, symbol = %self.symbol, "symbol entering FAILED");
        self.phase = SyncPhase::Failed;
        self.book = None;
        self.sequencer = None;
        self.buffer.clear();
    }

    /// Fresh restart after a worker panic: back to AWAIT_SNAPSHOT with all
    /// transient state discarded.
    pub fn reset(&mut self) -> Vec<SyncAction> {
        self.book = None;
        self.sequencer = None;
        self.buffer.clear();
        self.phase = SyncPhase::AwaitSnapshot;
        vec![SyncAction::RequestSnapshot]
    }

    fn buffer_update(&mut self, update: BookUpdate) {
        if self.buffer.len() >= self.buffer_limit {
            self.buffer.pop_front();
            self.counters.buffer_overflows.fetch_add(1, Ordering::Relaxed);
        }
        self.buffer.push_back(update);
        self.counters.record_buffer_depth(self.buffer.len() as u64);
    }

    fn apply_live(&mut self, update: BookUpdate) -> Vec<SyncAction> {
        match self.validate_and_apply(&update) {
            Ok(applied) => {
                if applied {
                    let book = self.book.as_ref().expect("READY implies a book");
                    vec![SyncAction::Emit(book.to_emit())]
                } else {
                    vec![]
                }
            }
            Err(reason) => self.enter_resync(reason),
        }
    }

    /// Validate sequence continuity, apply, and verify the checksum.
    /// `Ok(true)` means the book advanced; `Ok(false)` a silent drop.
    fn validate_and_apply(&mut self, update: &BookUpdate) -> Result<bool, ResyncReason> {
        let sequencer = self.sequencer.as_mut().expect("sequencer present");
        let decision = match sequencer.validate(update) {
            Ok(decision) => decision,
            Err(gap) => {
                self.counters.gaps_detected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    exchange = %self.exchange,
                    symbol = %self.symbol,
                    expected = gap.expected,
                    first_update_id = gap.first_update_id,
                    last_update_id = gap.last_update_id,
                    "sequence gap detected"
                );
                return Err(ResyncReason::Gap);
            }
        };

        let continuity = match decision {
            SeqDecision::Stale => {
                debug!(
                    exchange = %self.exchange,
                    symbol = %self.symbol,
                    last_update_id = update.last_update_id,
                    "dropping stale update"
                );
                return Ok(false);
            }
            SeqDecision::Apply(continuity) => continuity,
        };

        match continuity {
            Continuity::PuMatch => {
                self.counters.pu_matches.fetch_add(1, Ordering::Relaxed);
            }
            Continuity::Overlap => {
                self.counters.overlap_accepts.fetch_add(1, Ordering::Relaxed);
            }
            Continuity::First | Continuity::Incremental => {}
        }

        let book = self.book.as_mut().expect("book present when applying");
        if let Err(err) = book.apply(update) {
            return Err(match err {
                ApplyError::Crossed { best_bid, best_ask } => {
                    warn!(
                        exchange = %self.exchange,
                        symbol = %self.symbol,
                        best_bid = %best_bid,
                        best_ask = %best_ask,
                        "crossed book after update"
                    );
                    ResyncReason::CrossedBook
                }
                ApplyError::StaleUpdate { .. } => ResyncReason::Gap,
            });
        }

        if let Some(expected) = update.checksum {
            let computed = okx_book_checksum(&book.bids, &book.asks);
            if computed != expected {
                self.counters
                    .checksum_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    exchange = %self.exchange,
                    symbol = %self.symbol,
                    expected,
                    computed,
                    "book checksum mismatch"
                );
                return Err(ResyncReason::ChecksumMismatch);
            }
        }

        self.counters.updates_applied.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn enter_resync(&mut self, reason: ResyncReason) -> Vec<SyncAction> {
        self.counters.resyncs.fetch_add(1, Ordering::Relaxed);
        self.book = None;
        self.sequencer = None;
        self.phase = SyncPhase::Resync;
        vec![SyncAction::ScheduleResync(reason)]
    }
}
