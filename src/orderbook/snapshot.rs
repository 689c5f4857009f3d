//! REST depth snapshot client
//!
//! Fetches the bootstrap snapshot a symbol aligns its incremental stream
//! against. Admission goes through the shared [`WeightLimiter`]; on top of
//! that a per-symbol minimum re-fetch interval (30 s) is enforced with a
//! keyed GCRA limiter so resync storms cannot hammer one instrument.
//! Transient failures retry with exponential backoff scaled by the
//! exchange's punishment multiplier; exhausted retries surface as
//! `Unavailable` for the state machine to handle.

use crate::exchange::{BookKey, Exchange, MarketType};
use crate::orderbook::decoder::{parse_levels, parse_okx_levels, DecodeError};
use crate::orderbook::rate_limiter::{LimiterError, WeightLimiter};
use crate::orderbook::types::SnapshotData;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{DefaultKeyedRateLimiter, Quota};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Minimum spacing between snapshot requests for one symbol.
const MIN_REFETCH_INTERVAL: Duration = Duration::from_secs(30);

/// Base delay for transient-failure retries, before penalty scaling.
const RETRY_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Cap on a single retry delay.
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot unavailable for {key} after {attempts} attempts")]
    Unavailable { key: BookKey, attempts: u32 },

    #[error("snapshot request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("snapshot endpoint returned HTTP {status}")]
    Status { status: u16 },

    #[error("snapshot payload invalid: {0}")]
    Payload(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Limiter(#[from] LimiterError),
}

/// Source of bootstrap snapshots. The REST client is the production
/// implementation; tests inject fakes.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// Fetch a full depth snapshot with its exchange-supplied update id.
    async fn fetch_snapshot(
        &self,
        exchange: Exchange,
        symbol: &str,
        market_type: MarketType,
        depth: usize,
    ) -> Result<SnapshotData, SnapshotError>;
}

/// Production snapshot client over the exchanges' public depth endpoints.
pub struct RestSnapshotClient {
    http: reqwest::Client,
    limiter: Arc<WeightLimiter>,
    min_interval: DefaultKeyedRateLimiter<BookKey>,
    base_urls: HashMap<Exchange, String>,
    max_retries: u32,
}

impl RestSnapshotClient {
    /// Client with default endpoints, a 15 s request timeout, and the given
    /// shared limiter.
    pub fn new(limiter: Arc<WeightLimiter>, request_timeout: Duration, max_retries: u32) -> Self {
        let quota = Quota::with_period(MIN_REFETCH_INTERVAL)
            .expect("refetch interval is non-zero");
        Self {
            http: reqwest::Client::builder()
                .timeout(request_timeout)
                .user_agent(concat!("depthsync/", env!("CARGO_PKG_VERSION")))
                .build()
                .expect("reqwest client construction"),
            limiter,
            min_interval: DefaultKeyedRateLimiter::keyed(quota),
            base_urls: Exchange::ALL
                .iter()
                .map(|&ex| (ex, ex.rest_base().to_string()))
                .collect(),
            max_retries,
        }
    }

    /// Override one exchange's base URL (configuration and tests).
    pub fn with_base_url(mut self, exchange: Exchange, base: impl Into<String>) -> Self {
        self.base_urls.insert(exchange, base.into());
        self
    }

    fn snapshot_url(&self, exchange: Exchange, native: &str, depth: usize) -> String {
        let base = &self.base_urls[&exchange];
        match exchange {
            Exchange::BinanceSpot => {
                format!("{}/api/v3/depth?symbol={}&limit={}", base, native, depth)
            }
            Exchange::BinanceFutures => {
                format!("{}/fapi/v1/depth?symbol={}&limit={}", base, native, depth)
            }
            Exchange::OkxSpot | Exchange::OkxSwap => {
                format!("{}/api/v5/market/books?instId={}&sz={}", base, native, depth)
            }
            Exchange::Deribit => format!(
                "{}/api/v2/public/get_order_book?instrument_name={}&depth={}",
                base, native, depth
            ),
        }
    }

    async fn request_once(
        &self,
        exchange: Exchange,
        url: &str,
    ) -> Result<SnapshotData, SnapshotError> {
        let response = self.http.get(url).send().await?;
        let status = response.status().as_u16();
        if status == 418 || status == 429 {
            self.limiter.note_http_status(exchange, status);
            return Err(SnapshotError::Status { status });
        }
        if !response.status().is_success() {
            return Err(SnapshotError::Status { status });
        }

        let body = response.text().await?;
        let snapshot = parse_snapshot(exchange, &body)?;
        self.limiter.note_success(exchange);
        Ok(snapshot)
    }
}

#[async_trait]
impl SnapshotProvider for RestSnapshotClient {
    async fn fetch_snapshot(
        &self,
        exchange: Exchange,
        symbol: &str,
        market_type: MarketType,
        depth: usize,
    ) -> Result<SnapshotData, SnapshotError> {
        let key = BookKey::new(exchange, symbol);
        self.min_interval.until_key_ready(&key).await;

        let native = exchange.native_symbol(symbol, market_type);
        let url = self.snapshot_url(exchange, &native, depth);
        let weight = exchange.snapshot_weight(depth);

        let mut attempt = 0u32;
        loop {
            self.limiter.acquire(exchange, weight).await?;

            match self.request_once(exchange, &url).await {
                Ok(snapshot) => {
                    debug!(
                        exchange = %exchange,
                        symbol = %symbol,
                        update_id = snapshot.last_update_id,
                        bid_levels = snapshot.bids.len(),
                        ask_levels = snapshot.asks.len(),
                        "fetched depth snapshot"
                    );
                    return Ok(snapshot);
                }
                Err(err) => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        warn!(
                            exchange = %exchange,
                            symbol = %symbol,
                            attempts = attempt,
                            error = %err,
                            "snapshot retries exhausted"
                        );
                        return Err(SnapshotError::Unavailable {
                            key,
                            attempts: attempt,
                        });
                    }

                    let base = RETRY_BACKOFF_BASE * 2u32.saturating_pow(attempt - 1);
                    let delay = self
                        .limiter
                        .scaled_backoff(exchange, base)
                        .min(RETRY_BACKOFF_CAP);
                    warn!(
                        exchange = %exchange,
                        symbol = %symbol,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "snapshot request failed, retrying"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BinanceDepthResponse {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    /// Futures responses include the output time; spot omits it.
    #[serde(rename = "E")]
    event_time: Option<i64>,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct OkxDepthResponse {
    code: String,
    #[serde(default)]
    data: Vec<OkxDepthData>,
}

#[derive(Debug, Deserialize)]
struct OkxDepthData {
    bids: Vec<Vec<String>>,
    asks: Vec<Vec<String>>,
    ts: String,
    #[serde(rename = "seqId")]
    seq_id: u64,
    checksum: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct DeribitDepthResponse {
    result: DeribitDepthResult,
}

#[derive(Debug, Deserialize)]
struct DeribitDepthResult {
    bids: Vec<(serde_json::Number, serde_json::Number)>,
    asks: Vec<(serde_json::Number, serde_json::Number)>,
    change_id: u64,
    timestamp: i64,
}

fn parse_numeric_levels(
    raw: &[(serde_json::Number, serde_json::Number)],
) -> Result<Vec<crate::orderbook::types::PriceLevel>, SnapshotError> {
    use crate::orderbook::decoder::parse_decimal;
    raw.iter()
        .map(|(price, qty)| {
            Ok(crate::orderbook::types::PriceLevel::new(
                parse_decimal(&price.to_string())?,
                parse_decimal(&qty.to_string())?,
            ))
        })
        .collect()
}

fn timestamp(ms: i64) -> Result<DateTime<Utc>, SnapshotError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| SnapshotError::Payload(format!("invalid timestamp {}", ms)))
}

pub(crate) fn parse_snapshot(exchange: Exchange, body: &str) -> Result<SnapshotData, SnapshotError> {
    match exchange {
        Exchange::BinanceSpot | Exchange::BinanceFutures => {
            let response: BinanceDepthResponse =
                serde_json::from_str(body).map_err(DecodeError::Malformed)?;
            Ok(SnapshotData {
                last_update_id: response.last_update_id,
                bids: parse_levels(&response.bids)?,
                asks: parse_levels(&response.asks)?,
                checksum: None,
                event_time: response
                    .event_time
                    .map(timestamp)
                    .transpose()?
                    .unwrap_or_else(Utc::now),
            })
        }
        Exchange::OkxSpot | Exchange::OkxSwap => {
            let response: OkxDepthResponse =
                serde_json::from_str(body).map_err(DecodeError::Malformed)?;
            if response.code != "0" {
                return Err(SnapshotError::Payload(format!(
                    "okx error code {}",
                    response.code
                )));
            }
            let data = response
                .data
                .into_iter()
                .next()
                .ok_or_else(|| SnapshotError::Payload("okx snapshot without data".to_string()))?;
            let ts: i64 = data
                .ts
                .parse()
                .map_err(|_| SnapshotError::Payload(format!("invalid ts {}", data.ts)))?;
            Ok(SnapshotData {
                last_update_id: data.seq_id,
                bids: parse_okx_levels(&data.bids)?,
                asks: parse_okx_levels(&data.asks)?,
                checksum: data.checksum,
                event_time: timestamp(ts)?,
            })
        }
        Exchange::Deribit => {
            let response: DeribitDepthResponse =
                serde_json::from_str(body).map_err(DecodeError::Malformed)?;
            Ok(SnapshotData {
                last_update_id: response.result.change_id,
                bids: parse_numeric_levels(&response.result.bids)?,
                asks: parse_numeric_levels(&response.result.asks)?,
                checksum: None,
                event_time: timestamp(response.result.timestamp)?,
            })
        }
    }
}
