//! Per-symbol worker task
//!
//! One worker owns one [`SymbolSync`] machine and drives it through its four
//! suspension points: the inbound update queue, the snapshot fetch, the
//! rate-limit wait (inside the snapshot provider), and the resync backoff
//! sleep. Book mutation itself runs to completion between awaits, so an
//! in-flight update always finishes before shutdown is observed.
//!
//! Workers never touch each other's state; the manager supervises each task
//! and restarts it into AWAIT_SNAPSHOT if it panics.

use crate::exchange::{BookKey, MarketType};
use crate::orderbook::publisher::BookPublisher;
use crate::orderbook::rate_limiter::startup_jitter;
use crate::orderbook::snapshot::{SnapshotError, SnapshotProvider};
use crate::orderbook::sync::{SymbolSync, SyncAction};
use crate::orderbook::types::{
    BookSnapshot, BookUpdate, SnapshotData, SymbolCounters, SymbolHealth, SyncPhase,
};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Tuning for one worker; defaults match the production configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub depth_limit: usize,
    pub buffer_limit: usize,
    /// Base delay before re-fetching a snapshot after a resync.
    pub resync_delay: Duration,
    /// Cap on the exponentially growing resync delay.
    pub resync_delay_cap: Duration,
    /// Consecutive resyncs before the symbol is declared FAILED.
    pub max_resyncs: u32,
    /// Consecutive snapshot failures before the symbol is declared FAILED.
    pub max_snapshot_retries: u32,
    /// Spread initial snapshot requests with a random 0-9 s delay.
    pub startup_jitter: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            depth_limit: 400,
            buffer_limit: 1000,
            resync_delay: Duration::from_secs(1),
            resync_delay_cap: Duration::from_secs(60),
            max_resyncs: 10,
            max_snapshot_retries: 5,
            startup_jitter: true,
        }
    }
}

/// State one worker exposes to the manager's read side. The worker is the
/// only writer; readers get point-in-time copies.
pub struct SymbolShared {
    pub key: BookKey,
    pub market_type: MarketType,
    pub counters: Arc<SymbolCounters>,
    phase: Mutex<SyncPhase>,
    book: RwLock<Option<Arc<BookSnapshot>>>,
    buffer_size: AtomicU64,
    last_update_id: AtomicU64,
    last_event_time: Mutex<Option<DateTime<Utc>>>,
}

impl SymbolShared {
    pub fn new(key: BookKey, market_type: MarketType) -> Self {
        Self {
            key,
            market_type,
            counters: Arc::new(SymbolCounters::default()),
            phase: Mutex::new(SyncPhase::Idle),
            book: RwLock::new(None),
            buffer_size: AtomicU64::new(0),
            last_update_id: AtomicU64::new(0),
            last_event_time: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock().expect("phase mutex poisoned")
    }

    /// Latest emitted book, if the symbol has ever reached READY.
    pub fn book(&self) -> Option<Arc<BookSnapshot>> {
        self.book.read().expect("book lock poisoned").clone()
    }

    pub fn health_row(&self) -> SymbolHealth {
        let counters = self.counters.snapshot();
        SymbolHealth {
            exchange: self.key.exchange,
            symbol: self.key.symbol.clone(),
            phase: self.phase(),
            last_update_id: self.last_update_id.load(Ordering::Relaxed),
            updates_applied: counters.updates_applied,
            gaps_detected: counters.gaps_detected,
            resyncs: counters.resyncs,
            buffer_size: self.buffer_size.load(Ordering::Relaxed),
            last_event_time: *self
                .last_event_time
                .lock()
                .expect("event time mutex poisoned"),
        }
    }
}

/// Drives one symbol's state machine against the real world.
pub struct SymbolWorker {
    key: BookKey,
    market_type: MarketType,
    machine: SymbolSync,
    snapshot: Arc<dyn SnapshotProvider>,
    publisher: BookPublisher,
    shared: Arc<SymbolShared>,
    cancel: CancellationToken,
    cfg: WorkerConfig,
    consecutive_resyncs: u32,
    snapshot_failures: u32,
    first_snapshot: bool,
}

impl SymbolWorker {
    pub fn new(
        shared: Arc<SymbolShared>,
        snapshot: Arc<dyn SnapshotProvider>,
        publisher: BookPublisher,
        cancel: CancellationToken,
        cfg: WorkerConfig,
    ) -> Self {
        let machine = SymbolSync::new(
            shared.key.exchange,
            shared.key.symbol.clone(),
            shared.market_type,
            cfg.depth_limit,
            cfg.buffer_limit,
            shared.counters.clone(),
        );
        Self {
            key: shared.key.clone(),
            market_type: shared.market_type,
            machine,
            snapshot,
            publisher,
            shared,
            cancel,
            cfg,
            consecutive_resyncs: 0,
            snapshot_failures: 0,
            first_snapshot: true,
        }
    }

    /// Discard all transient state after a panic restart.
    pub fn recover_after_panic(&mut self) {
        warn!(key = %self.key, "restarting worker after panic");
        self.machine.reset();
        self.consecutive_resyncs = 0;
        self.snapshot_failures = 0;
        self.publish_phase();
    }

    /// Run until cancellation or channel close. Emits one final book on the
    /// way out when synchronized.
    pub async fn run(&mut self, rx: &mut mpsc::UnboundedReceiver<BookUpdate>) {
        if self.machine.phase() == SyncPhase::Idle {
            let actions = self.machine.on_subscribe();
            self.handle_actions(actions);
        }

        loop {
            if self.cancel.is_cancelled() {
                self.final_emit();
                return;
            }
            self.publish_phase();

            let keep_going = match self.machine.phase() {
                SyncPhase::AwaitSnapshot => self.await_snapshot(rx).await,
                SyncPhase::Ready => self.ready(rx).await,
                SyncPhase::Resync => self.resync_backoff(rx).await,
                SyncPhase::Failed => {
                    self.park_failed(rx).await;
                    false
                }
                // IDLE is consumed above; SYNCING never persists across
                // method boundaries.
                SyncPhase::Idle | SyncPhase::Syncing => true,
            };
            if !keep_going {
                self.final_emit();
                return;
            }
        }
    }

    /// Execute emit actions immediately. Phase transitions the actions imply
    /// are handled by the caller's phase loop.
    fn handle_actions(&self, actions: Vec<SyncAction>) {
        for action in actions {
            match action {
                SyncAction::Emit(book) => self.store_and_publish(book),
                SyncAction::RequestSnapshot | SyncAction::ScheduleResync(_) => {}
            }
        }
    }

    fn store_and_publish(&self, book: BookSnapshot) {
        let shared = Arc::new(book);
        self.shared
            .last_update_id
            .store(shared.last_update_id, Ordering::Relaxed);
        *self
            .shared
            .last_event_time
            .lock()
            .expect("event time mutex poisoned") = Some(shared.timestamp);
        *self.shared.book.write().expect("book lock poisoned") = Some(shared.clone());
        self.publisher.publish((*shared).clone());
    }

    fn publish_phase(&self) {
        *self.shared.phase.lock().expect("phase mutex poisoned") = self.machine.phase();
        self.shared
            .buffer_size
            .store(self.machine.buffer_len() as u64, Ordering::Relaxed);
    }

    fn final_emit(&mut self) {
        if let Some(book) = self.machine.book() {
            debug!(key = %self.key, "emitting final book on shutdown");
            self.store_and_publish(book.to_emit());
        }
        self.publish_phase();
    }

    fn buffer_inbound(&mut self, update: BookUpdate) {
        let actions = self.machine.on_update(update);
        self.handle_actions(actions);
        self.publish_phase();
    }

    /// AWAIT_SNAPSHOT: fetch while buffering live updates.
    /// Returns false to shut down.
    async fn await_snapshot(&mut self, rx: &mut mpsc::UnboundedReceiver<BookUpdate>) -> bool {
        let cancel = self.cancel.clone();

        if self.first_snapshot {
            self.first_snapshot = false;
            if self.cfg.startup_jitter {
                let jitter = startup_jitter();
                debug!(key = %self.key, jitter_ms = jitter.as_millis() as u64, "startup jitter");
                tokio::select! {
                    _ = cancel.cancelled() => return false,
                    _ = sleep(jitter) => {}
                }
            }
        }

        // The fetch future owns its inputs so inbound updates can be
        // buffered concurrently.
        let fetch = {
            let provider = self.snapshot.clone();
            let exchange = self.key.exchange;
            let symbol = self.key.symbol.clone();
            let market_type = self.market_type;
            let depth = self.cfg.depth_limit;
            async move {
                provider
                    .fetch_snapshot(exchange, &symbol, market_type, depth)
                    .await
            }
        };
        tokio::pin!(fetch);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                result = &mut fetch => {
                    return self.on_snapshot_result(result, rx).await;
                }
                update = rx.recv() => match update {
                    Some(update) => self.buffer_inbound(update),
                    None => return false,
                },
            }
        }
    }

    async fn on_snapshot_result(
        &mut self,
        result: Result<SnapshotData, SnapshotError>,
        rx: &mut mpsc::UnboundedReceiver<BookUpdate>,
    ) -> bool {
        match result {
            Ok(snapshot) => {
                self.snapshot_failures = 0;
                let actions = self.machine.on_snapshot(snapshot);
                self.handle_actions(actions);
                if self.machine.phase() == SyncPhase::Ready {
                    self.consecutive_resyncs = 0;
                }
                true
            }
            Err(err) => {
                self.snapshot_failures += 1;
                if self.snapshot_failures > self.cfg.max_snapshot_retries {
                    error!(
                        key = %self.key,
                        failures = self.snapshot_failures,
                        error = %err,
                        "snapshot permanently unavailable, failing symbol"
                    );
                    self.machine.fail();
                    return true;
                }
                warn!(
                    key = %self.key,
                    failures = self.snapshot_failures,
                    error = %err,
                    "snapshot fetch failed, backing off"
                );
                let delay = self.backoff_delay(self.snapshot_failures);
                if !self.sleep_buffering(delay, rx).await {
                    return false;
                }
                let actions = self.machine.on_snapshot_unavailable();
                self.handle_actions(actions);
                true
            }
        }
    }

    /// READY: apply updates as they arrive. Returns false to shut down.
    async fn ready(&mut self, rx: &mut mpsc::UnboundedReceiver<BookUpdate>) -> bool {
        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                update = rx.recv() => match update {
                    Some(update) => {
                        let actions = self.machine.on_update(update);
                        self.handle_actions(actions);
                        self.publish_phase();
                        if self.machine.phase() != SyncPhase::Ready {
                            return true;
                        }
                    }
                    None => return false,
                },
            }
        }
    }

    /// RESYNC: exponential, jittered wait, then back to AWAIT_SNAPSHOT.
    /// Returns false to shut down.
    async fn resync_backoff(&mut self, rx: &mut mpsc::UnboundedReceiver<BookUpdate>) -> bool {
        self.consecutive_resyncs += 1;
        if self.consecutive_resyncs > self.cfg.max_resyncs {
            error!(
                key = %self.key,
                resyncs = self.consecutive_resyncs,
                "max consecutive resyncs exceeded, failing symbol"
            );
            self.machine.fail();
            return true;
        }

        let delay = self.backoff_delay(self.consecutive_resyncs);
        info!(
            key = %self.key,
            attempt = self.consecutive_resyncs,
            delay_ms = delay.as_millis() as u64,
            "resync scheduled"
        );
        if !self.sleep_buffering(delay, rx).await {
            return false;
        }
        let actions = self.machine.on_resync_timer();
        self.handle_actions(actions);
        true
    }

    /// FAILED: keep draining the queue so it cannot grow unbounded, until
    /// shutdown or operator removal.
    async fn park_failed(&mut self, rx: &mut mpsc::UnboundedReceiver<BookUpdate>) {
        let cancel = self.cancel.clone();
        self.publish_phase();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                update = rx.recv() => {
                    if update.is_none() {
                        return;
                    }
                }
            }
        }
    }

    /// Sleep while still buffering inbound updates. Returns false if
    /// cancelled or the channel closed.
    async fn sleep_buffering(
        &mut self,
        delay: Duration,
        rx: &mut mpsc::UnboundedReceiver<BookUpdate>,
    ) -> bool {
        let cancel = self.cancel.clone();
        let timer = sleep(delay);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = &mut timer => return true,
                update = rx.recv() => match update {
                    Some(update) => self.buffer_inbound(update),
                    None => return false,
                },
            }
        }
    }

    /// Exponential backoff with a random half-step of jitter, capped.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self
            .cfg
            .resync_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.cfg.resync_delay_cap);
        let jitter_ms = if base.as_millis() > 1 {
            rand::thread_rng().gen_range(0..base.as_millis() as u64 / 2)
        } else {
            0
        };
        (base + Duration::from_millis(jitter_ms)).min(self.cfg.resync_delay_cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Exchange;
    use crate::orderbook::types::PriceLevel;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicU32;

    struct FixedSnapshots {
        update_id: AtomicU64,
        calls: AtomicU32,
    }

    impl FixedSnapshots {
        fn new(update_id: u64) -> Self {
            Self {
                update_id: AtomicU64::new(update_id),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl SnapshotProvider for FixedSnapshots {
        async fn fetch_snapshot(
            &self,
            _exchange: Exchange,
            _symbol: &str,
            _market_type: MarketType,
            _depth: usize,
        ) -> Result<SnapshotData, SnapshotError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(SnapshotData {
                last_update_id: self.update_id.load(Ordering::Relaxed),
                bids: vec![PriceLevel::new(dec!(100), dec!(1))],
                asks: vec![PriceLevel::new(dec!(101), dec!(1))],
                checksum: None,
                event_time: Utc::now(),
            })
        }
    }

    fn test_config() -> WorkerConfig {
        WorkerConfig {
            resync_delay: Duration::from_millis(10),
            resync_delay_cap: Duration::from_millis(50),
            startup_jitter: false,
            ..WorkerConfig::default()
        }
    }

    fn spawn_worker(
        provider: Arc<FixedSnapshots>,
    ) -> (
        Arc<SymbolShared>,
        BookPublisher,
        mpsc::UnboundedSender<BookUpdate>,
        CancellationToken,
        tokio::task::JoinHandle<()>,
    ) {
        let shared = Arc::new(SymbolShared::new(
            BookKey::new(Exchange::BinanceSpot, "BTC-USDT"),
            MarketType::Spot,
        ));
        let publisher = BookPublisher::new(64);
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut worker = SymbolWorker::new(
            shared.clone(),
            provider,
            publisher.clone(),
            cancel.clone(),
            test_config(),
        );
        let handle = tokio::spawn(async move {
            worker.run(&mut rx).await;
        });
        (shared, publisher, tx, cancel, handle)
    }

    fn spot_update(first: u64, last: u64, bid: (Decimal, Decimal)) -> BookUpdate {
        BookUpdate {
            exchange: Exchange::BinanceSpot,
            symbol: "BTC-USDT".to_string(),
            market_type: MarketType::Spot,
            first_update_id: first,
            last_update_id: last,
            prev_update_id: None,
            bids: vec![PriceLevel::new(bid.0, bid.1)],
            asks: vec![],
            checksum: None,
            event_time: Utc::now(),
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_worker_syncs_and_applies_updates() {
        let provider = Arc::new(FixedSnapshots::new(1000));
        let (shared, _publisher, tx, cancel, handle) = spawn_worker(provider);

        wait_for(|| shared.phase() == SyncPhase::Ready).await;

        tx.send(spot_update(1001, 1001, (dec!(100), dec!(2))))
            .unwrap();
        wait_for(|| shared.counters.snapshot().updates_applied == 1).await;

        let book = shared.book().unwrap();
        assert_eq!(book.last_update_id, 1001);
        assert_eq!(book.bids[0], ["100".to_string(), "2".to_string()]);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_resyncs_after_gap() {
        let provider = Arc::new(FixedSnapshots::new(1000));
        let (shared, _publisher, tx, cancel, handle) = spawn_worker(provider.clone());

        wait_for(|| shared.phase() == SyncPhase::Ready).await;

        // 1005 > 1001 with nothing in between: gap, then recovery against a
        // fresh snapshot.
        provider.update_id.store(2000, Ordering::Relaxed);
        tx.send(spot_update(1005, 1005, (dec!(100), dec!(3))))
            .unwrap();

        wait_for(|| shared.counters.snapshot().gaps_detected == 1).await;
        wait_for(|| {
            shared.phase() == SyncPhase::Ready
                && shared.book().map(|b| b.last_update_id) == Some(2000)
        })
        .await;
        assert!(provider.calls.load(Ordering::Relaxed) >= 2);
        assert_eq!(shared.counters.snapshot().resyncs, 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_emits_final_book_on_shutdown() {
        let provider = Arc::new(FixedSnapshots::new(1000));
        let (shared, publisher, _tx, cancel, handle) = spawn_worker(provider);

        wait_for(|| shared.phase() == SyncPhase::Ready).await;
        let before = publisher.stats().queue_depth;

        cancel.cancel();
        handle.await.unwrap();

        // The shutdown path queues one final state.
        assert!(publisher.stats().queue_depth > before);
    }
}
