//! Outbound orderbook publishing
//!
//! Workers hand every normalized book to a bounded in-memory queue; a single
//! drain task serializes and forwards to the downstream [`OrderbookSink`]
//! (the JetStream publisher in production, a capture in tests). The queue is
//! last-wins per symbol: on overflow the oldest queued book for the same
//! (exchange, symbol) is coalesced away so the freshest state always
//! survives. Per-symbol emission order is preserved.

use crate::orderbook::types::BookSnapshot;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// Default outbound queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("sink delivery failed: {0}")]
    Sink(String),
}

/// Downstream consumer of serialized orderbook payloads.
#[async_trait]
pub trait OrderbookSink: Send + Sync {
    async fn deliver(&self, subject: &str, payload: Vec<u8>) -> Result<(), PublishError>;
}

/// Sink used by the binary when no message bus is wired up: counts and
/// traces deliveries.
#[derive(Debug, Default)]
pub struct TraceSink {
    delivered: AtomicU64,
}

impl TraceSink {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl OrderbookSink for TraceSink {
    async fn deliver(&self, subject: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        trace!(subject = %subject, bytes = payload.len(), "orderbook delivered");
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PublisherCounters {
    published: AtomicU64,
    coalesced: AtomicU64,
    dropped: AtomicU64,
    delivery_errors: AtomicU64,
}

/// Point-in-time publisher statistics.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct PublisherStats {
    pub published: u64,
    pub coalesced: u64,
    pub dropped: u64,
    pub delivery_errors: u64,
    pub queue_depth: usize,
}

struct Inner {
    queue: Mutex<VecDeque<BookSnapshot>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    counters: PublisherCounters,
}

/// Handle to the bounded outbound queue; cheap to clone into every worker.
#[derive(Clone)]
pub struct BookPublisher {
    inner: Arc<Inner>,
}

impl BookPublisher {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
                capacity,
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                counters: PublisherCounters::default(),
            }),
        }
    }

    /// Enqueue a normalized book without blocking.
    ///
    /// On overflow the oldest queued entry for the same (exchange, symbol)
    /// is removed (`coalesced`); if no such entry exists the globally oldest
    /// entry is dropped (`dropped`). After [`close`](Self::close) books are
    /// silently discarded.
    pub fn publish(&self, book: BookSnapshot) {
        if self.inner.closed.load(Ordering::Acquire) {
            self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        {
            let mut queue = self.inner.queue.lock().expect("publisher queue poisoned");
            if queue.len() >= self.inner.capacity {
                let same_symbol = queue
                    .iter()
                    .position(|queued| {
                        queued.exchange == book.exchange && queued.symbol == book.symbol
                    });
                match same_symbol {
                    Some(index) => {
                        queue.remove(index);
                        self.inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                    }
                    None => {
                        queue.pop_front();
                        self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            queue.push_back(book);
        }
        self.inner.notify.notify_one();
    }

    /// Stop accepting new books. The drain task finishes the backlog and
    /// exits.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_one();
    }

    pub fn stats(&self) -> PublisherStats {
        let queue_depth = self
            .inner
            .queue
            .lock()
            .expect("publisher queue poisoned")
            .len();
        PublisherStats {
            published: self.inner.counters.published.load(Ordering::Relaxed),
            coalesced: self.inner.counters.coalesced.load(Ordering::Relaxed),
            dropped: self.inner.counters.dropped.load(Ordering::Relaxed),
            delivery_errors: self.inner.counters.delivery_errors.load(Ordering::Relaxed),
            queue_depth,
        }
    }

    /// Spawn the drain task. It forwards until cancelled *and* empty, so a
    /// graceful shutdown flushes the backlog before the task exits.
    pub fn spawn_drain(
        &self,
        sink: Arc<dyn OrderbookSink>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let publisher = self.clone();
        tokio::spawn(async move {
            publisher.drain(sink, cancel).await;
        })
    }

    async fn drain(&self, sink: Arc<dyn OrderbookSink>, cancel: CancellationToken) {
        loop {
            let next = {
                let mut queue = self.inner.queue.lock().expect("publisher queue poisoned");
                queue.pop_front()
            };

            match next {
                Some(book) => {
                    let subject = book.subject();
                    let payload = match serde_json::to_vec(&book) {
                        Ok(payload) => payload,
                        Err(err) => {
                            error!(subject = %subject, error = %err, "orderbook serialization failed");
                            self.inner
                                .counters
                                .delivery_errors
                                .fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                    };
                    match sink.deliver(&subject, payload).await {
                        Ok(()) => {
                            self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            self.inner
                                .counters
                                .delivery_errors
                                .fetch_add(1, Ordering::Relaxed);
                            error!(subject = %subject, error = %err, "sink delivery failed");
                        }
                    }
                }
                None => {
                    if cancel.is_cancelled() || self.inner.closed.load(Ordering::Acquire) {
                        debug!("publisher drained, exiting");
                        return;
                    }
                    tokio::select! {
                        _ = self.inner.notify.notified() => {}
                        _ = cancel.cancelled() => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MarketType;
    use chrono::Utc;
    use std::sync::Mutex as StdMutex;

    fn snapshot(exchange: &'static str, symbol: &str, id: u64) -> BookSnapshot {
        BookSnapshot {
            exchange,
            market_type: MarketType::Spot,
            symbol: symbol.to_string(),
            timestamp: Utc::now(),
            last_update_id: id,
            bids: vec![],
            asks: vec![],
        }
    }

    #[derive(Default)]
    struct CaptureSink {
        subjects: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl OrderbookSink for CaptureSink {
        async fn deliver(&self, subject: &str, _payload: Vec<u8>) -> Result<(), PublishError> {
            self.subjects
                .lock()
                .unwrap()
                .push(subject.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_overflow_coalesces_same_symbol() {
        let publisher = BookPublisher::new(2);
        publisher.publish(snapshot("binance", "BTC-USDT", 1));
        publisher.publish(snapshot("binance", "ETH-USDT", 2));
        publisher.publish(snapshot("binance", "BTC-USDT", 3));

        let stats = publisher.stats();
        assert_eq!(stats.coalesced, 1);
        assert_eq!(stats.dropped, 0);
        assert_eq!(stats.queue_depth, 2);

        // The freshest BTC-USDT state survived.
        let queue = publisher.inner.queue.lock().unwrap();
        assert!(queue
            .iter()
            .any(|b| b.symbol == "BTC-USDT" && b.last_update_id == 3));
        assert!(!queue
            .iter()
            .any(|b| b.symbol == "BTC-USDT" && b.last_update_id == 1));
    }

    #[test]
    fn test_overflow_without_same_symbol_drops_oldest() {
        let publisher = BookPublisher::new(2);
        publisher.publish(snapshot("binance", "BTC-USDT", 1));
        publisher.publish(snapshot("binance", "ETH-USDT", 2));
        publisher.publish(snapshot("binance", "SOL-USDT", 3));

        let stats = publisher.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.queue_depth, 2);
    }

    #[test]
    fn test_queue_depth_never_exceeds_capacity() {
        let publisher = BookPublisher::new(8);
        for id in 0..100 {
            publisher.publish(snapshot("binance", "BTC-USDT", id));
            assert!(publisher.stats().queue_depth <= 8);
        }
    }

    #[tokio::test]
    async fn test_drain_preserves_per_symbol_order_and_flushes_on_cancel() {
        let publisher = BookPublisher::new(16);
        let sink = Arc::new(CaptureSink::default());
        let cancel = CancellationToken::new();

        for id in 1..=3 {
            publisher.publish(snapshot("binance", "BTC-USDT", id));
        }
        publisher.publish(snapshot("okx", "ETH-USDT", 9));

        let handle = publisher.spawn_drain(sink.clone(), cancel.clone());
        cancel.cancel();
        handle.await.unwrap();

        let subjects = sink.subjects.lock().unwrap();
        assert_eq!(subjects.len(), 4);
        assert_eq!(subjects[0], "orderbook.binance.spot.BTC-USDT");
        assert_eq!(subjects[3], "orderbook.okx.spot.ETH-USDT");
        assert_eq!(publisher.stats().published, 4);
    }

    #[tokio::test]
    async fn test_no_publish_after_close() {
        let publisher = BookPublisher::new(4);
        publisher.close();
        publisher.publish(snapshot("binance", "BTC-USDT", 1));

        assert_eq!(publisher.stats().queue_depth, 0);
        assert_eq!(publisher.stats().dropped, 1);
    }
}
