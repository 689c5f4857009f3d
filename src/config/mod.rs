//! Configuration management
//!
//! TOML application config with per-exchange subscription records plus
//! tuning sections for the publisher, snapshot client, and sync machinery.
//! Symbols are listed in exchange-native form (`BTCUSDT`, `BTC-USDT-SWAP`,
//! `BTC-PERPETUAL`) so spot and derivative instruments stay unambiguous;
//! normalization happens at load time.

pub mod credentials;

pub use credentials::{Credentials, SecretString};

use crate::exchange::{Exchange, MarketType};
use crate::orderbook::worker::WorkerConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub exchanges: HashMap<Exchange, ExchangeConfig>,

    #[serde(default)]
    pub publisher: PublisherSettings,

    #[serde(default)]
    pub snapshot: SnapshotSettings,

    #[serde(default)]
    pub sync: SyncSettings,
}

/// One exchange's subscription record.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExchangeConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Exchange-native symbols to track.
    pub symbols: Vec<String>,

    /// Retained levels per side; falls back to the exchange default (400).
    pub depth_limit: Option<usize>,

    /// Per-symbol depth overrides keyed by native symbol.
    #[serde(default)]
    pub depth_overrides: HashMap<String, usize>,

    /// Data types collected for this exchange. Only `orderbook` is consumed
    /// here; other types belong to sibling collectors.
    #[serde(default = "default_data_types")]
    pub data_types: Vec<String>,
}

impl ExchangeConfig {
    pub fn collects_orderbooks(&self) -> bool {
        self.data_types.iter().any(|t| t == "orderbook")
    }

    pub fn depth_for(&self, exchange: Exchange, native_symbol: &str) -> usize {
        self.depth_overrides
            .get(native_symbol)
            .copied()
            .or(self.depth_limit)
            .unwrap_or_else(|| exchange.default_depth_limit())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublisherSettings {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotSettings {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncSettings {
    #[serde(default = "default_buffer_limit")]
    pub buffer_limit: usize,

    #[serde(default = "default_resync_delay_ms")]
    pub resync_delay_ms: u64,

    #[serde(default = "default_resync_delay_cap_ms")]
    pub resync_delay_cap_ms: u64,

    #[serde(default = "default_max_resyncs")]
    pub max_resyncs: u32,

    #[serde(default = "default_max_snapshot_retries")]
    pub max_snapshot_retries: u32,

    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,

    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    #[serde(default = "default_enabled")]
    pub startup_jitter: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            buffer_limit: default_buffer_limit(),
            resync_delay_ms: default_resync_delay_ms(),
            resync_delay_cap_ms: default_resync_delay_cap_ms(),
            max_resyncs: default_max_resyncs(),
            max_snapshot_retries: default_max_snapshot_retries(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            startup_jitter: default_enabled(),
        }
    }
}

fn default_enabled() -> bool {
    true
}
fn default_data_types() -> Vec<String> {
    vec!["orderbook".to_string()]
}
fn default_queue_capacity() -> usize {
    crate::orderbook::publisher::DEFAULT_QUEUE_CAPACITY
}
fn default_request_timeout_secs() -> u64 {
    15
}
fn default_max_retries() -> u32 {
    5
}
fn default_buffer_limit() -> usize {
    1000
}
fn default_resync_delay_ms() -> u64 {
    1000
}
fn default_resync_delay_cap_ms() -> u64 {
    60_000
}
fn default_max_resyncs() -> u32 {
    10
}
fn default_max_snapshot_retries() -> u32 {
    5
}
fn default_heartbeat_timeout_secs() -> u64 {
    30
}
fn default_shutdown_grace_secs() -> u64 {
    5
}

/// One validated subscription resolved from the config.
#[derive(Debug, Clone)]
pub struct SymbolSubscription {
    pub exchange: Exchange,
    pub native_symbol: String,
    pub canonical_symbol: String,
    pub market_type: MarketType,
    pub depth_limit: usize,
}

impl AppConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (&exchange, cfg) in &self.exchanges {
            for native in &cfg.symbols {
                if exchange.normalize_symbol(native).is_none() {
                    return Err(ConfigError::Invalid(format!(
                        "cannot normalize symbol {} for {}",
                        native, exchange
                    )));
                }
            }
        }
        if self.publisher.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "publisher.queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve every enabled orderbook subscription.
    pub fn subscriptions(&self) -> Vec<SymbolSubscription> {
        let mut out = Vec::new();
        for (&exchange, cfg) in &self.exchanges {
            if !cfg.enabled || !cfg.collects_orderbooks() {
                continue;
            }
            for native in &cfg.symbols {
                // Validated at load time.
                let Some(canonical) = exchange.normalize_symbol(native) else {
                    continue;
                };
                out.push(SymbolSubscription {
                    exchange,
                    native_symbol: native.clone(),
                    canonical_symbol: canonical,
                    market_type: exchange.market_type(native),
                    depth_limit: cfg.depth_for(exchange, native),
                });
            }
        }
        out
    }

    /// Worker tuning for one subscription.
    pub fn worker_config(&self, subscription: &SymbolSubscription) -> WorkerConfig {
        WorkerConfig {
            depth_limit: subscription.depth_limit,
            buffer_limit: self.sync.buffer_limit,
            resync_delay: Duration::from_millis(self.sync.resync_delay_ms),
            resync_delay_cap: Duration::from_millis(self.sync.resync_delay_cap_ms),
            max_resyncs: self.sync.max_resyncs,
            max_snapshot_retries: self.sync.max_snapshot_retries,
            startup_jitter: self.sync.startup_jitter,
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.sync.shutdown_grace_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.heartbeat_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.snapshot.request_timeout_secs)
    }

    /// Optional API credentials for each configured exchange, from the
    /// environment.
    pub fn credentials(&self) -> HashMap<Exchange, Credentials> {
        self.exchanges
            .keys()
            .filter_map(|&ex| Credentials::from_env(ex).map(|c| (ex, c)))
            .collect()
    }
}
