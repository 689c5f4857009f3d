//! Fleet-level integration tests: the manager wired to fake snapshot
//! providers and a capturing sink, driven by decoded updates.

use async_trait::async_trait;
use chrono::Utc;
use depthsync::config::{AppConfig, ExchangeConfig, PublisherSettings, SnapshotSettings, SyncSettings};
use depthsync::exchange::{BookKey, Exchange, MarketType};
use depthsync::orderbook::decoder::decode;
use depthsync::orderbook::publisher::{OrderbookSink, PublishError};
use depthsync::orderbook::snapshot::{SnapshotError, SnapshotProvider};
use depthsync::orderbook::types::{BookUpdate, PriceLevel, SnapshotData, SyncPhase};
use depthsync::orderbook::OrderbookManager;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

/// Snapshot provider with per-symbol update ids and optional one-shot panic
/// injection.
struct FleetProvider {
    update_ids: Mutex<HashMap<BookKey, u64>>,
    panic_once: Mutex<HashSet<BookKey>>,
    calls: AtomicU32,
}

impl FleetProvider {
    fn new() -> Self {
        Self {
            update_ids: Mutex::new(HashMap::new()),
            panic_once: Mutex::new(HashSet::new()),
            calls: AtomicU32::new(0),
        }
    }

    fn set_update_id(&self, key: BookKey, id: u64) {
        self.update_ids.lock().unwrap().insert(key, id);
    }

    fn panic_on_next_fetch(&self, key: BookKey) {
        self.panic_once.lock().unwrap().insert(key);
    }
}

#[async_trait]
impl SnapshotProvider for FleetProvider {
    async fn fetch_snapshot(
        &self,
        exchange: Exchange,
        symbol: &str,
        _market_type: MarketType,
        _depth: usize,
    ) -> Result<SnapshotData, SnapshotError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let key = BookKey::new(exchange, symbol);
        if self.panic_once.lock().unwrap().remove(&key) {
            panic!("injected fault for {}", key);
        }
        let id = self
            .update_ids
            .lock()
            .unwrap()
            .get(&key)
            .copied()
            .unwrap_or(1000);
        Ok(SnapshotData {
            last_update_id: id,
            bids: vec![PriceLevel::new(dec!(100), dec!(1))],
            asks: vec![PriceLevel::new(dec!(101), dec!(1))],
            checksum: None,
            event_time: Utc::now(),
        })
    }
}

#[derive(Default)]
struct CaptureSink {
    deliveries: Mutex<Vec<(String, serde_json::Value)>>,
}

impl CaptureSink {
    fn count(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }

    fn subjects(&self) -> Vec<String> {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .map(|(subject, _)| subject.clone())
            .collect()
    }
}

#[async_trait]
impl OrderbookSink for CaptureSink {
    async fn deliver(&self, subject: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        let value: serde_json::Value =
            serde_json::from_slice(&payload).map_err(|e| PublishError::Sink(e.to_string()))?;
        self.deliveries
            .lock()
            .unwrap()
            .push((subject.to_string(), value));
        Ok(())
    }
}

fn fleet_config(native_symbols: &[&str]) -> AppConfig {
    let mut exchanges = HashMap::new();
    exchanges.insert(
        Exchange::BinanceSpot,
        ExchangeConfig {
            enabled: true,
            symbols: native_symbols.iter().map(|s| s.to_string()).collect(),
            depth_limit: Some(400),
            depth_overrides: HashMap::new(),
            data_types: vec!["orderbook".to_string()],
        },
    );
    AppConfig {
        exchanges,
        publisher: PublisherSettings {
            queue_capacity: 256,
        },
        snapshot: SnapshotSettings::default(),
        sync: SyncSettings {
            resync_delay_ms: 10,
            resync_delay_cap_ms: 50,
            startup_jitter: false,
            ..SyncSettings::default()
        },
    }
}

fn spot_update(symbol: &str, first: u64, last: u64, bid: (Decimal, Decimal)) -> BookUpdate {
    BookUpdate {
        exchange: Exchange::BinanceSpot,
        symbol: symbol.to_string(),
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

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {}", what);
}

async fn wait_all_ready(manager: &OrderbookManager) {
    wait_for("fleet ready", || {
        let health = manager.health();
        health.symbols_ready == health.symbols_total
    })
    .await;
}

#[tokio::test]
async fn test_decoded_frame_flows_to_sink() {
    let provider = Arc::new(FleetProvider::new());
    let sink = Arc::new(CaptureSink::default());
    let config = fleet_config(&["BTCUSDT"]);

    let manager = OrderbookManager::start_with(&config, provider, sink.clone())
        .await
        .unwrap();
    wait_all_ready(&manager).await;

    // A raw exchange frame, decoded exactly as the stream task would.
    let raw = r#"{
        "e": "depthUpdate",
        "E": 1699999999123,
        "s": "BTCUSDT",
        "U": 1001,
        "u": 1001,
        "b": [["100.0", "2.0"]],
        "a": []
    }"#;
    let update = decode(Exchange::BinanceSpot, raw).unwrap().unwrap();
    manager.route_update(update);

    wait_for("update applied", || {
        manager
            .get(Exchange::BinanceSpot, "BTC-USDT")
            .map(|b| b.last_update_id)
            == Some(1001)
    })
    .await;

    let book = manager.get(Exchange::BinanceSpot, "BTC-USDT").unwrap();
    assert_eq!(book.bids[0], ["100.0".to_string(), "2.0".to_string()]);

    wait_for("sink deliveries", || sink.count() >= 2).await;
    for subject in sink.subjects() {
        assert_eq!(subject, "orderbook.binance.spot.BTC-USDT");
    }

    let stats = manager.stats(Some(Exchange::BinanceSpot), Some("BTC-USDT"));
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].counters.updates_applied, 1);

    // No live streams were connected, so no per-exchange frame counters.
    assert!(manager.health().stream_decode_errors.is_empty());

    manager.stop().await;
}

#[tokio::test]
async fn test_crash_isolation_between_symbols() {
    let provider = Arc::new(FleetProvider::new());
    let sink = Arc::new(CaptureSink::default());
    let config = fleet_config(&["BTCUSDT", "ETHUSDT", "SOLUSDT"]);

    // Symbol A's first snapshot fetch panics inside its worker task.
    provider.panic_on_next_fetch(BookKey::new(Exchange::BinanceSpot, "BTC-USDT"));

    let manager = OrderbookManager::start_with(&config, provider.clone(), sink.clone())
        .await
        .unwrap();

    // The supervisor restarts the panicked worker and the whole fleet still
    // converges to READY.
    wait_all_ready(&manager).await;
    // 3 symbols synced, plus the extra fetch after the injected panic.
    assert!(provider.calls.load(Ordering::Relaxed) >= 4);

    // Peers keep processing updates in order.
    manager.route_update(spot_update("ETH-USDT", 1001, 1001, (dec!(100), dec!(5))));
    manager.route_update(spot_update("SOL-USDT", 1001, 1001, (dec!(100), dec!(7))));
    wait_for("peer updates applied", || {
        manager
            .get(Exchange::BinanceSpot, "ETH-USDT")
            .map(|b| b.last_update_id)
            == Some(1001)
            && manager
                .get(Exchange::BinanceSpot, "SOL-USDT")
                .map(|b| b.last_update_id)
                == Some(1001)
    })
    .await;

    // The restarted symbol works too.
    manager.route_update(spot_update("BTC-USDT", 1001, 1001, (dec!(100), dec!(9))));
    wait_for("restarted symbol applies updates", || {
        manager
            .get(Exchange::BinanceSpot, "BTC-USDT")
            .map(|b| b.last_update_id)
            == Some(1001)
    })
    .await;

    manager.stop().await;
}

#[tokio::test]
async fn test_gap_triggers_fleet_local_resync() {
    let provider = Arc::new(FleetProvider::new());
    let sink = Arc::new(CaptureSink::default());
    let config = fleet_config(&["BTCUSDT", "ETHUSDT"]);

    let manager = OrderbookManager::start_with(&config, provider.clone(), sink.clone())
        .await
        .unwrap();
    wait_all_ready(&manager).await;

    // Gap on BTC only; the fresh snapshot carries a later update id.
    provider.set_update_id(BookKey::new(Exchange::BinanceSpot, "BTC-USDT"), 2000);
    manager.route_update(spot_update("BTC-USDT", 1005, 1005, (dec!(100), dec!(2))));

    wait_for("gap recovery", || {
        manager
            .get(Exchange::BinanceSpot, "BTC-USDT")
            .map(|b| b.last_update_id)
            == Some(2000)
    })
    .await;

    let stats = manager.stats(Some(Exchange::BinanceSpot), Some("BTC-USDT"));
    assert_eq!(stats[0].counters.gaps_detected, 1);
    assert_eq!(stats[0].counters.resyncs, 1);

    // The peer never left READY.
    let peer = manager.stats(Some(Exchange::BinanceSpot), Some("ETH-USDT"));
    assert_eq!(peer[0].phase, SyncPhase::Ready);
    assert_eq!(peer[0].counters.resyncs, 0);

    manager.stop().await;
}

#[tokio::test]
async fn test_graceful_shutdown_flushes_and_silences() {
    let provider = Arc::new(FleetProvider::new());
    let sink = Arc::new(CaptureSink::default());
    let symbols = ["BTCUSDT", "ETHUSDT", "SOLUSDT"];
    let config = fleet_config(&symbols);

    let manager = OrderbookManager::start_with(&config, provider, sink.clone())
        .await
        .unwrap();
    wait_all_ready(&manager).await;

    for (i, canonical) in ["BTC-USDT", "ETH-USDT", "SOL-USDT"].iter().enumerate() {
        manager.route_update(spot_update(
            canonical,
            1001,
            1001,
            (dec!(100), Decimal::from(i as u32 + 2)),
        ));
    }

    manager.stop().await;

    // Every worker emitted at least its sync emit, the applied update (when
    // it arrived in time), and one final book; the queue drained fully.
    let subjects = sink.subjects();
    for canonical in ["BTC-USDT", "ETH-USDT", "SOL-USDT"] {
        let per_symbol = subjects
            .iter()
            .filter(|s| s.ends_with(canonical))
            .count();
        assert!(
            per_symbol >= 2,
            "expected initial + final emission for {}, got {}",
            canonical,
            per_symbol
        );
    }

    // Nothing is delivered after stop() returns.
    let after_stop = sink.count();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(sink.count(), after_stop);
}

#[tokio::test]
async fn test_get_returns_none_for_untracked_symbol() {
    let provider = Arc::new(FleetProvider::new());
    let sink = Arc::new(CaptureSink::default());
    let config = fleet_config(&["BTCUSDT"]);

    let manager = OrderbookManager::start_with(&config, provider, sink)
        .await
        .unwrap();

    assert!(manager.get(Exchange::BinanceSpot, "DOGE-USDT").is_none());
    // Routing to an untracked symbol is dropped, not an error.
    manager.route_update(spot_update("DOGE-USDT", 1, 1, (dec!(1), dec!(1))));

    manager.stop().await;
}
