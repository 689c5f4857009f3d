//! Fleet coordinator
//!
//! Owns every per-symbol worker, the exchange stream demultiplexers, the
//! shared snapshot client and weight limiter, and the outbound publisher.
//! Decoded updates are routed by `(exchange, canonical symbol)`; each worker
//! mutates only its own state, so a failure (including a panic) stays local
//! to one symbol and the supervisor restarts it into AWAIT_SNAPSHOT.

use crate::config::AppConfig;
use crate::exchange::{BookKey, Exchange};
use crate::orderbook::publisher::{BookPublisher, OrderbookSink, PublisherStats};
use crate::orderbook::rate_limiter::WeightLimiter;
use crate::orderbook::snapshot::{RestSnapshotClient, SnapshotProvider};
use crate::orderbook::types::{
    BookSnapshot, BookUpdate, CounterSnapshot, FleetHealth, HealthStatus, SymbolHealth, SyncPhase,
};
use crate::orderbook::websocket::{ExchangeStream, StreamConfig};
use crate::orderbook::worker::{SymbolShared, SymbolWorker, WorkerConfig};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("duplicate subscription for {0}")]
    DuplicateSubscription(BookKey),
}

/// Per-symbol counters plus phase, as returned by [`OrderbookManager::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct SymbolStatsView {
    pub exchange: Exchange,
    pub symbol: String,
    pub phase: SyncPhase,
    pub counters: CounterSnapshot,
}

struct SymbolEntry {
    shared: Arc<SymbolShared>,
    update_tx: mpsc::UnboundedSender<BookUpdate>,
}

/// Coordinator for the whole (exchange, symbol) fleet.
pub struct OrderbookManager {
    entries: Arc<HashMap<BookKey, SymbolEntry>>,
    publisher: BookPublisher,
    cancel: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
    stream_handles: Vec<JoinHandle<()>>,
    /// Dropped-frame counters captured from each exchange stream.
    stream_decode_errors: HashMap<Exchange, Arc<AtomicU64>>,
    drain_handle: JoinHandle<()>,
    shutdown_grace: Duration,
}

impl OrderbookManager {
    /// Start the full production fleet: REST snapshot client, exchange
    /// streams, workers, and the publisher drain into `sink`.
    pub async fn start(
        config: &AppConfig,
        sink: Arc<dyn OrderbookSink>,
    ) -> Result<Self, ManagerError> {
        let limiter = Arc::new(WeightLimiter::new());
        let snapshots = Arc::new(RestSnapshotClient::new(
            limiter,
            config.request_timeout(),
            config.snapshot.max_retries,
        ));
        let mut manager = Self::start_with(config, snapshots, sink).await?;
        manager.connect_streams(config);
        Ok(manager)
    }

    /// Start workers and the publisher without connecting any exchange
    /// stream. Updates enter through [`route_update`](Self::route_update) —
    /// used by tests and replay tooling; `start` layers the live streams on
    /// top.
    pub async fn start_with(
        config: &AppConfig,
        snapshots: Arc<dyn SnapshotProvider>,
        sink: Arc<dyn OrderbookSink>,
    ) -> Result<Self, ManagerError> {
        let cancel = CancellationToken::new();
        let publisher = BookPublisher::new(config.publisher.queue_capacity);
        // The drain exits via `publisher.close()` during stop(), after the
        // workers have flushed their final books.
        let drain_handle = publisher.spawn_drain(sink, CancellationToken::new());

        let mut entries = HashMap::new();
        let mut worker_handles = Vec::new();

        let subscriptions = config.subscriptions();
        if subscriptions.is_empty() {
            warn!("no enabled orderbook subscriptions in config");
        }

        for subscription in subscriptions {
            let key = BookKey::new(subscription.exchange, subscription.canonical_symbol.clone());
            if entries.contains_key(&key) {
                return Err(ManagerError::DuplicateSubscription(key));
            }

            let shared = Arc::new(SymbolShared::new(key.clone(), subscription.market_type));
            let (update_tx, update_rx) = mpsc::unbounded_channel();

            let handle = spawn_supervised_worker(
                shared.clone(),
                snapshots.clone(),
                publisher.clone(),
                cancel.clone(),
                config.worker_config(&subscription),
                update_rx,
            );
            worker_handles.push(handle);
            entries.insert(
                key,
                SymbolEntry {
                    shared,
                    update_tx,
                },
            );
        }

        info!(symbols = entries.len(), "orderbook manager started");
        Ok(Self {
            entries: Arc::new(entries),
            publisher,
            cancel,
            worker_handles,
            stream_handles: Vec::new(),
            stream_decode_errors: HashMap::new(),
            drain_handle,
            shutdown_grace: config.shutdown_grace(),
        })
    }

    /// Open one WebSocket connection per configured exchange and route its
    /// decoded updates into the fleet.
    fn connect_streams(&mut self, config: &AppConfig) {
        let mut by_exchange: HashMap<Exchange, Vec<String>> = HashMap::new();
        for subscription in config.subscriptions() {
            by_exchange
                .entry(subscription.exchange)
                .or_default()
                .push(subscription.native_symbol.clone());
        }

        let stream_cfg = StreamConfig {
            heartbeat_timeout: config.heartbeat_timeout(),
        };

        for (exchange, native_symbols) in by_exchange {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let stream = ExchangeStream::new(
                exchange,
                native_symbols,
                tx,
                self.cancel.clone(),
                stream_cfg.clone(),
            );
            self.stream_decode_errors
                .insert(exchange, stream.decode_errors());
            self.stream_handles.push(stream.start());

            // Demultiplexer: one task per exchange fanning out to workers.
            let entries = self.entries.clone();
            let cancel = self.cancel.clone();
            self.stream_handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        update = rx.recv() => match update {
                            Some(update) => route(&entries, update),
                            None => return,
                        },
                    }
                }
            }));
        }
    }

    /// Route one decoded update to its owning worker. Public so replay and
    /// test harnesses can drive the fleet without a live stream.
    pub fn route_update(&self, update: BookUpdate) {
        route(&self.entries, update);
    }

    /// Immutable snapshot of the current book, or `None` while the symbol
    /// has not reached READY.
    pub fn get(&self, exchange: Exchange, symbol: &str) -> Option<Arc<BookSnapshot>> {
        self.entries
            .get(&BookKey::new(exchange, symbol))?
            .shared
            .book()
    }

    /// Aggregated counters, optionally filtered by exchange and symbol.
    pub fn stats(
        &self,
        exchange: Option<Exchange>,
        symbol: Option<&str>,
    ) -> Vec<SymbolStatsView> {
        let mut views: Vec<SymbolStatsView> = self
            .entries
            .values()
            .filter(|entry| exchange.map_or(true, |ex| entry.shared.key.exchange == ex))
            .filter(|entry| symbol.map_or(true, |s| entry.shared.key.symbol == s))
            .map(|entry| SymbolStatsView {
                exchange: entry.shared.key.exchange,
                symbol: entry.shared.key.symbol.clone(),
                phase: entry.shared.phase(),
                counters: entry.shared.counters.snapshot(),
            })
            .collect();
        views.sort_by(|a, b| {
            a.exchange
                .to_string()
                .cmp(&b.exchange.to_string())
                .then_with(|| a.symbol.cmp(&b.symbol))
        });
        views
    }

    /// Health snapshot for the operator endpoint.
    pub fn health(&self) -> FleetHealth {
        let symbols: Vec<SymbolHealth> = self
            .entries
            .values()
            .map(|entry| entry.shared.health_row())
            .collect();

        let symbols_total = symbols.len();
        let symbols_ready = symbols
            .iter()
            .filter(|row| row.phase == SyncPhase::Ready)
            .count();
        let symbols_failed = symbols
            .iter()
            .filter(|row| row.phase == SyncPhase::Failed)
            .count();

        let status = if symbols_failed > 0 {
            HealthStatus::Error
        } else if symbols_ready == symbols_total {
            HealthStatus::Ok
        } else {
            HealthStatus::Degraded
        };

        FleetHealth {
            status,
            symbols_total,
            symbols_ready,
            symbols_failed,
            stream_decode_errors: self
                .stream_decode_errors
                .iter()
                .map(|(&exchange, counter)| (exchange, counter.load(Ordering::Relaxed)))
                .collect(),
            symbols,
        }
    }

    pub fn publisher_stats(&self) -> PublisherStats {
        self.publisher.stats()
    }

    /// Graceful shutdown: workers finish their in-flight update and emit a
    /// final book, the publisher flushes, and everything exits within the
    /// grace period (stragglers are aborted).
    pub async fn stop(self) {
        info!("stopping orderbook manager");
        self.cancel.cancel();

        for handle in self.stream_handles {
            let abort = handle.abort_handle();
            if timeout(self.shutdown_grace, handle).await.is_err() {
                warn!("stream task exceeded shutdown grace, aborting");
                abort.abort();
            }
        }
        for handle in self.worker_handles {
            let abort = handle.abort_handle();
            if timeout(self.shutdown_grace, handle).await.is_err() {
                warn!("worker exceeded shutdown grace, aborting");
                abort.abort();
            }
        }

        // Workers are done emitting; close the queue and let the drain
        // deliver the backlog.
        self.publisher.close();
        let abort = self.drain_handle.abort_handle();
        if timeout(self.shutdown_grace, self.drain_handle)
            .await
            .is_err()
        {
            warn!("publisher drain exceeded shutdown grace, aborting");
            abort.abort();
        }

        info!("orderbook manager stopped");
    }
}

fn route(entries: &HashMap<BookKey, SymbolEntry>, update: BookUpdate) {
    let key = BookKey::new(update.exchange, update.symbol.clone());
    match entries.get(&key) {
        Some(entry) => {
            if entry.update_tx.send(update).is_err() {
                debug!(key = %key, "worker gone, dropping update");
            }
        }
        None => {
            debug!(key = %key, "update for untracked symbol dropped");
        }
    }
}

/// Spawn a worker wrapped in a supervisor: a panic restarts the symbol into
/// AWAIT_SNAPSHOT without touching its peers.
fn spawn_supervised_worker(
    shared: Arc<SymbolShared>,
    snapshots: Arc<dyn SnapshotProvider>,
    publisher: BookPublisher,
    cancel: CancellationToken,
    cfg: WorkerConfig,
    mut update_rx: mpsc::UnboundedReceiver<BookUpdate>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let key = shared.key.clone();
        let mut worker = SymbolWorker::new(shared, snapshots, publisher, cancel.clone(), cfg);
        loop {
            let run = AssertUnwindSafe(worker.run(&mut update_rx))
                .catch_unwind()
                .await;
            match run {
                Ok(()) => return,
                Err(_) => {
                    if cancel.is_cancelled() {
                        return;
                    }
                    error!(key = %key, "worker panicked, restarting symbol");
                    worker.recover_after_panic();
                }
            }
        }
    })
}

