//! Exchange taxonomy and symbol normalization
//!
//! Canonical identifiers for the supported venues, their market types, and
//! the mapping between exchange-native symbols (`BTCUSDT`, `BTC-USDT-SWAP`)
//! and the canonical dash-separated form (`BTC-USDT`) used everywhere
//! downstream of the decoder.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Quote assets recognized when splitting Binance-style concatenated symbols.
///
/// Ordered longest-first so `BTCUSDT` resolves to `BTC`/`USDT` rather than
/// `BTCUSD`/`T`.
const QUOTE_ASSETS: &[&str] = &[
    "FDUSD", "USDT", "USDC", "BUSD", "TUSD", "USD", "BTC", "ETH", "BNB", "EUR", "TRY",
];

/// A supported exchange stream.
///
/// Spot and derivatives are distinct variants even where they share an
/// endpoint (OKX): the pair keys every book, and `BTC-USDT` spot and
/// `BTC-USDT-SWAP` both normalize to the canonical `BTC-USDT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exchange {
    BinanceSpot,
    BinanceFutures,
    OkxSpot,
    OkxSwap,
    Deribit,
}

impl Exchange {
    /// All supported exchanges, in configuration order.
    pub const ALL: [Exchange; 5] = [
        Exchange::BinanceSpot,
        Exchange::BinanceFutures,
        Exchange::OkxSpot,
        Exchange::OkxSwap,
        Exchange::Deribit,
    ];

    /// Short venue name used in outbound subjects and payloads.
    pub fn venue(&self) -> &'static str {
        match self {
            Exchange::BinanceSpot | Exchange::BinanceFutures => "binance",
            Exchange::OkxSpot | Exchange::OkxSwap => "okx",
            Exchange::Deribit => "deribit",
        }
    }

    /// REST base URL for depth snapshots.
    pub fn rest_base(&self) -> &'static str {
        match self {
            Exchange::BinanceSpot => "https://api.binance.com",
            Exchange::BinanceFutures => "https://fapi.binance.com",
            Exchange::OkxSpot | Exchange::OkxSwap => "https://www.okx.com",
            Exchange::Deribit => "https://www.deribit.com",
        }
    }

    /// WebSocket endpoint for depth streams.
    pub fn ws_url(&self) -> &'static str {
        match self {
            Exchange::BinanceSpot => "wss://stream.binance.com:9443/stream",
            Exchange::BinanceFutures => "wss://fstream.binance.com/stream",
            Exchange::OkxSpot | Exchange::OkxSwap => "wss://ws.okx.com:8443/ws/v5/public",
            Exchange::Deribit => "wss://www.deribit.com/ws/api/v2",
        }
    }

    /// Request weight charged for a depth snapshot of `depth` levels.
    ///
    /// Binance charges 50 for up to 500 levels and 250 for the deep 5000
    /// level snapshot. OKX and Deribit publish per-request (not weighted)
    /// limits, modeled here as weight 1 against their configured ceilings.
    pub fn snapshot_weight(&self, depth: usize) -> u32 {
        match self {
            Exchange::BinanceSpot | Exchange::BinanceFutures => {
                if depth > 500 {
                    250
                } else {
                    50
                }
            }
            Exchange::OkxSpot | Exchange::OkxSwap | Exchange::Deribit => 1,
        }
    }

    /// Default weight ceiling per sliding window for this exchange.
    pub fn default_weight_ceiling(&self) -> u32 {
        match self {
            Exchange::BinanceSpot | Exchange::BinanceFutures => 1200,
            Exchange::OkxSpot | Exchange::OkxSwap | Exchange::Deribit => 20,
        }
    }

    /// Default retained depth per book side.
    pub fn default_depth_limit(&self) -> usize {
        400
    }

    /// Market type of an exchange-native symbol.
    pub fn market_type(&self, native_symbol: &str) -> MarketType {
        match self {
            Exchange::BinanceSpot | Exchange::OkxSpot => MarketType::Spot,
            Exchange::BinanceFutures | Exchange::OkxSwap => MarketType::Perpetual,
            Exchange::Deribit => {
                if native_symbol.ends_with("-PERPETUAL") {
                    MarketType::Perpetual
                } else {
                    MarketType::Option
                }
            }
        }
    }

    /// Map an exchange-native symbol to canonical form.
    ///
    /// `BTCUSDT` becomes `BTC-USDT`, `BTC-USDT-SWAP` becomes `BTC-USDT`.
    /// Deribit instrument names are already canonical for our purposes.
    /// Returns `None` when a Binance symbol does not end in a known quote
    /// asset.
    pub fn normalize_symbol(&self, native: &str) -> Option<String> {
        match self {
            Exchange::BinanceSpot | Exchange::BinanceFutures => {
                let upper = native.to_uppercase();
                QUOTE_ASSETS.iter().find_map(|quote| {
                    upper
                        .strip_suffix(quote)
                        .filter(|base| !base.is_empty())
                        .map(|base| format!("{}-{}", base, quote))
                })
            }
            Exchange::OkxSpot | Exchange::OkxSwap => {
                let upper = native.to_uppercase();
                Some(upper.strip_suffix("-SWAP").unwrap_or(&upper).to_string())
            }
            Exchange::Deribit => Some(native.to_uppercase()),
        }
    }

    /// Map a canonical symbol back to the exchange-native form used in
    /// subscription requests and REST queries.
    pub fn native_symbol(&self, canonical: &str, _market_type: MarketType) -> String {
        match self {
            Exchange::BinanceSpot | Exchange::BinanceFutures => canonical.replace('-', ""),
            Exchange::OkxSpot => canonical.to_string(),
            Exchange::OkxSwap => format!("{}-SWAP", canonical),
            Exchange::Deribit => canonical.to_string(),
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Exchange::BinanceSpot => "binance_spot",
            Exchange::BinanceFutures => "binance_futures",
            Exchange::OkxSpot => "okx_spot",
            Exchange::OkxSwap => "okx_swap",
            Exchange::Deribit => "deribit",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Exchange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binance_spot" => Ok(Exchange::BinanceSpot),
            "binance_futures" => Ok(Exchange::BinanceFutures),
            "okx_spot" => Ok(Exchange::OkxSpot),
            "okx_swap" => Ok(Exchange::OkxSwap),
            "deribit" => Ok(Exchange::Deribit),
            other => Err(format!("unknown exchange: {}", other)),
        }
    }
}

/// Market type of an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Spot,
    Perpetual,
    Option,
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MarketType::Spot => "spot",
            MarketType::Perpetual => "perpetual",
            MarketType::Option => "option",
        };
        write!(f, "{}", name)
    }
}

/// Key identifying one tracked book: `(exchange, canonical symbol)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BookKey {
    pub exchange: Exchange,
    pub symbol: String,
}

impl BookKey {
    pub fn new(exchange: Exchange, symbol: impl Into<String>) -> Self {
        Self {
            exchange,
            symbol: symbol.into(),
        }
    }
}

impl fmt::Display for BookKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.symbol)
    }
}
