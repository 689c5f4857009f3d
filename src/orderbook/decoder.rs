//! WebSocket payload decoding
//!
//! Normalizes exchange-native depth frames into the canonical [`BookUpdate`].
//! Recognized non-data frames (subscription acks, keepalive envelopes)
//! decode to `Ok(None)`; anything else is an error the caller counts and
//! drops.

use crate::exchange::{Exchange, MarketType};
use crate::orderbook::types::{BookUpdate, PriceLevel};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use thiserror::Error;

/// Decoder failures. Malformed frames are dropped by the caller; they never
/// affect book state.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unrecognized frame for {exchange}: {detail}")]
    Unrecognized {
        exchange: Exchange,
        detail: String,
    },

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid decimal in frame: {0}")]
    InvalidDecimal(String),

    #[error("cannot normalize symbol {0}")]
    UnknownSymbol(String),

    #[error("invalid timestamp {0}")]
    InvalidTimestamp(i64),

    #[error("invalid sequence id {0}")]
    InvalidSequenceId(i64),
}

/// Decode one raw frame for `exchange`.
///
/// Returns `Ok(None)` for frames that are valid but carry no depth data.
pub fn decode(exchange: Exchange, raw: &str) -> Result<Option<BookUpdate>, DecodeError> {
    match exchange {
        Exchange::BinanceSpot | Exchange::BinanceFutures => decode_binance(exchange, raw),
        Exchange::OkxSpot | Exchange::OkxSwap => decode_okx(exchange, raw),
        Exchange::Deribit => decode_deribit(raw),
    }
}

pub(crate) fn parse_decimal(s: &str) -> Result<Decimal, DecodeError> {
    Decimal::from_str(s).map_err(|_| DecodeError::InvalidDecimal(s.to_string()))
}

pub(crate) fn parse_levels(raw: &[[String; 2]]) -> Result<Vec<PriceLevel>, DecodeError> {
    raw.iter()
        .map(|[price, qty]| Ok(PriceLevel::new(parse_decimal(price)?, parse_decimal(qty)?)))
        .collect()
}

fn event_time(ms: i64) -> Result<DateTime<Utc>, DecodeError> {
    DateTime::from_timestamp_millis(ms).ok_or(DecodeError::InvalidTimestamp(ms))
}

// ---------------------------------------------------------------------------
// Binance
// ---------------------------------------------------------------------------

/// Combined-stream envelope: `{"stream": "...", "data": {...}}`.
#[derive(Debug, Deserialize)]
struct BinanceStreamFrame {
    #[allow(dead_code)]
    stream: String,
    data: BinanceDepthUpdate,
}

/// `depthUpdate` event, shared by spot and USD-M futures; futures adds `pu`.
#[derive(Debug, Deserialize)]
struct BinanceDepthUpdate {
    #[serde(rename = "e")]
    event_type: String,

    #[serde(rename = "E")]
    event_time: i64,

    #[serde(rename = "s")]
    symbol: String,

    #[serde(rename = "U")]
    first_update_id: u64,

    #[serde(rename = "u")]
    final_update_id: u64,

    #[serde(rename = "pu")]
    prev_update_id: Option<u64>,

    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,

    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
}

fn decode_binance(exchange: Exchange, raw: &str) -> Result<Option<BookUpdate>, DecodeError> {
    // Combined streams wrap the event; single streams deliver it bare.
    let event = match serde_json::from_str::<BinanceStreamFrame>(raw) {
        Ok(frame) => frame.data,
        Err(_) => serde_json::from_str::<BinanceDepthUpdate>(raw)?,
    };

    if event.event_type != "depthUpdate" {
        return Ok(None);
    }

    let symbol = exchange
        .normalize_symbol(&event.symbol)
        .ok_or_else(|| DecodeError::UnknownSymbol(event.symbol.clone()))?;

    Ok(Some(BookUpdate {
        exchange,
        market_type: exchange.market_type(&event.symbol),
        symbol,
        first_update_id: event.first_update_id,
        last_update_id: event.final_update_id,
        prev_update_id: event.prev_update_id,
        bids: parse_levels(&event.bids)?,
        asks: parse_levels(&event.asks)?,
        checksum: None,
        event_time: event_time(event.event_time)?,
    }))
}

// ---------------------------------------------------------------------------
// OKX
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct OkxFrame {
    /// Present on subscription acks and error frames.
    event: Option<String>,
    arg: Option<OkxArg>,
    #[serde(default)]
    data: Vec<OkxBookData>,
}

#[derive(Debug, Deserialize)]
struct OkxArg {
    #[allow(dead_code)]
    channel: String,
    #[serde(rename = "instId")]
    inst_id: String,
}

/// One `books` channel payload. Levels are `[price, qty, _, order_count]`.
#[derive(Debug, Deserialize)]
struct OkxBookData {
    bids: Vec<Vec<String>>,
    asks: Vec<Vec<String>>,
    ts: String,
    #[serde(rename = "seqId")]
    seq_id: i64,
    #[serde(rename = "prevSeqId")]
    prev_seq_id: i64,
    checksum: Option<i32>,
}

pub(crate) fn parse_okx_levels(raw: &[Vec<String>]) -> Result<Vec<PriceLevel>, DecodeError> {
    raw.iter()
        .map(|level| {
            let [price, qty, ..] = level.as_slice() else {
                return Err(DecodeError::InvalidDecimal(format!("{:?}", level)));
            };
            Ok(PriceLevel::new(parse_decimal(price)?, parse_decimal(qty)?))
        })
        .collect()
}

fn decode_okx(exchange: Exchange, raw: &str) -> Result<Option<BookUpdate>, DecodeError> {
    let frame: OkxFrame = serde_json::from_str(raw)?;

    if frame.event.is_some() {
        // subscribe/unsubscribe ack or error notification
        return Ok(None);
    }
    let Some(arg) = frame.arg else {
        return Err(DecodeError::Unrecognized {
            exchange,
            detail: "frame without arg or event".to_string(),
        });
    };
    let Some(data) = frame.data.into_iter().next() else {
        return Ok(None);
    };

    let symbol = exchange
        .normalize_symbol(&arg.inst_id)
        .ok_or_else(|| DecodeError::UnknownSymbol(arg.inst_id.clone()))?;
    let ts: i64 = data
        .ts
        .parse()
        .map_err(|_| DecodeError::InvalidDecimal(data.ts.clone()))?;
    let seq_id =
        u64::try_from(data.seq_id).map_err(|_| DecodeError::InvalidSequenceId(data.seq_id))?;

    Ok(Some(BookUpdate {
        exchange,
        market_type: exchange.market_type(&arg.inst_id),
        symbol,
        first_update_id: seq_id,
        last_update_id: seq_id,
        // -1 marks snapshot frames outside the sequence chain
        prev_update_id: u64::try_from(data.prev_seq_id).ok(),
        bids: parse_okx_levels(&data.bids)?,
        asks: parse_okx_levels(&data.asks)?,
        checksum: data.checksum,
        event_time: event_time(ts)?,
    }))
}

// ---------------------------------------------------------------------------
// Deribit
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DeribitFrame {
    method: Option<String>,
    params: Option<DeribitParams>,
}

#[derive(Debug, Deserialize)]
struct DeribitParams {
    #[allow(dead_code)]
    channel: Option<String>,
    data: Option<DeribitBookData>,
}

/// Book changes carry `[action, price, amount]` triples; `"delete"` maps to
/// the zero-quantity remove sentinel.
#[derive(Debug, Deserialize)]
struct DeribitBookData {
    timestamp: i64,
    instrument_name: String,
    change_id: u64,
    prev_change_id: Option<u64>,
    #[serde(default)]
    bids: Vec<(String, serde_json::Number, serde_json::Number)>,
    #[serde(default)]
    asks: Vec<(String, serde_json::Number, serde_json::Number)>,
}

fn parse_deribit_levels(
    raw: &[(String, serde_json::Number, serde_json::Number)],
) -> Result<Vec<PriceLevel>, DecodeError> {
    raw.iter()
        .map(|(action, price, amount)| {
            let price = parse_decimal(&price.to_string())?;
            let quantity = if action == "delete" {
                Decimal::ZERO
            } else {
                parse_decimal(&amount.to_string())?
            };
            Ok(PriceLevel::new(price, quantity))
        })
        .collect()
}

fn decode_deribit(raw: &str) -> Result<Option<BookUpdate>, DecodeError> {
    let frame: DeribitFrame = serde_json::from_str(raw)?;

    match frame.method.as_deref() {
        Some("subscription") => {}
        // heartbeats, test_requests, RPC replies
        _ => return Ok(None),
    }
    let Some(data) = frame.params.and_then(|p| p.data) else {
        return Ok(None);
    };

    let exchange = Exchange::Deribit;
    let symbol = exchange
        .normalize_symbol(&data.instrument_name)
        .ok_or_else(|| DecodeError::UnknownSymbol(data.instrument_name.clone()))?;

    Ok(Some(BookUpdate {
        exchange,
        market_type: exchange.market_type(&data.instrument_name),
        symbol,
        first_update_id: data.change_id,
        last_update_id: data.change_id,
        prev_update_id: data.prev_change_id,
        bids: parse_deribit_levels(&data.bids)?,
        asks: parse_deribit_levels(&data.asks)?,
        checksum: None,
        event_time: event_time(data.timestamp)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_decode_binance_spot_update() {
        let raw = r#"{
            "e": "depthUpdate",
            "E": 1699999999123,
            "s": "BTCUSDT",
            "U": 1000,
            "u": 1005,
            "b": [["67650.00", "1.23400"]],
            "a": [["67651.00", "0.98700"], ["67651.50", "0"]]
        }"#;

        let update = decode(Exchange::BinanceSpot, raw).unwrap().unwrap();
        assert_eq!(update.symbol, "BTC-USDT");
        assert_eq!(update.market_type, MarketType::Spot);
        assert_eq!(update.first_update_id, 1000);
        assert_eq!(update.last_update_id, 1005);
        assert_eq!(update.prev_update_id, None);
        assert_eq!(update.bids[0].price, dec!(67650.00));
        assert_eq!(update.asks[1].quantity, Decimal::ZERO);
        assert_eq!(update.event_time.timestamp_millis(), 1699999999123);
    }

    #[test]
    fn test_decode_binance_combined_stream_envelope() {
        let raw = r#"{
            "stream": "btcusdt@depth@100ms",
            "data": {
                "e": "depthUpdate",
                "E": 1699999999123,
                "s": "BTCUSDT",
                "U": 157,
                "u": 160,
                "pu": 149,
                "b": [["0.0024", "10"]],
                "a": [["0.0026", "100"]]
            }
        }"#;

        let update = decode(Exchange::BinanceFutures, raw).unwrap().unwrap();
        assert_eq!(update.market_type, MarketType::Perpetual);
        assert_eq!(update.prev_update_id, Some(149));
        assert_eq!(update.first_update_id, 157);
    }

    #[test]
    fn test_decode_okx_update() {
        let raw = r#"{
            "arg": {"channel": "books", "instId": "BTC-USDT-SWAP"},
            "action": "update",
            "data": [{
                "asks": [["8476.98", "415", "0", "13"]],
                "bids": [["8476.97", "256", "0", "12"]],
                "ts": "1597026383085",
                "checksum": -855196043,
                "prevSeqId": 123456,
                "seqId": 123457
            }]
        }"#;

        let update = decode(Exchange::OkxSwap, raw).unwrap().unwrap();
        assert_eq!(update.symbol, "BTC-USDT");
        assert_eq!(update.market_type, MarketType::Perpetual);
        assert_eq!(update.first_update_id, 123457);
        assert_eq!(update.prev_update_id, Some(123456));
        assert_eq!(update.checksum, Some(-855196043));
        assert_eq!(update.bids[0].price, dec!(8476.97));
    }

    #[test]
    fn test_decode_okx_snapshot_frame_has_no_prev() {
        let raw = r#"{
            "arg": {"channel": "books", "instId": "BTC-USDT"},
            "action": "snapshot",
            "data": [{
                "asks": [["100.1", "1", "0", "1"]],
                "bids": [["100.0", "1", "0", "1"]],
                "ts": "1597026383085",
                "checksum": 123,
                "prevSeqId": -1,
                "seqId": 10
            }]
        }"#;

        let update = decode(Exchange::OkxSpot, raw).unwrap().unwrap();
        assert_eq!(update.prev_update_id, None);
        assert_eq!(update.market_type, MarketType::Spot);
    }

    #[test]
    fn test_decode_okx_subscribe_ack_is_ignored() {
        let raw = r#"{"event": "subscribe", "arg": {"channel": "books", "instId": "BTC-USDT"}}"#;
        assert!(decode(Exchange::OkxSpot, raw).unwrap().is_none());
    }

    #[test]
    fn test_decode_deribit_change() {
        let raw = r#"{
            "jsonrpc": "2.0",
            "method": "subscription",
            "params": {
                "channel": "book.BTC-PERPETUAL.100ms",
                "data": {
                    "type": "change",
                    "timestamp": 1699999999123,
                    "instrument_name": "BTC-PERPETUAL",
                    "change_id": 9000,
                    "prev_change_id": 8999,
                    "bids": [["new", 50000.5, 10.0], ["delete", 49999.0, 0.0]],
                    "asks": [["change", 50001.0, 2.5]]
                }
            }
        }"#;

        let update = decode(Exchange::Deribit, raw).unwrap().unwrap();
        assert_eq!(update.symbol, "BTC-PERPETUAL");
        assert_eq!(update.market_type, MarketType::Perpetual);
        assert_eq!(update.first_update_id, 9000);
        assert_eq!(update.prev_update_id, Some(8999));
        assert_eq!(update.bids[0].price, dec!(50000.5));
        // "delete" maps to the remove sentinel regardless of carried amount
        assert_eq!(update.bids[1].quantity, Decimal::ZERO);
        assert_eq!(update.asks[0].quantity, dec!(2.5));
    }

    #[test]
    fn test_decode_deribit_rpc_reply_is_ignored() {
        let raw = r#"{"jsonrpc": "2.0", "id": 1, "result": ["book.BTC-PERPETUAL.100ms"]}"#;
        assert!(decode(Exchange::Deribit, raw).unwrap().is_none());
    }

    #[test]
    fn test_malformed_frame_is_error() {
        assert!(decode(Exchange::BinanceSpot, "not json").is_err());
        assert!(decode(Exchange::OkxSpot, "[1,2,3]").is_err());
    }

    #[test]
    fn test_round_trip_preserves_decimal_strings() {
        let raw = r#"{
            "e": "depthUpdate",
            "E": 1699999999123,
            "s": "ETHUSDT",
            "U": 5,
            "u": 5,
            "b": [["1800.50", "0.030"]],
            "a": []
        }"#;

        let update = decode(Exchange::BinanceSpot, raw).unwrap().unwrap();
        // Exact scale survives: "1800.50" does not collapse to "1800.5"
        assert_eq!(update.bids[0].price.to_string(), "1800.50");
        assert_eq!(update.bids[0].quantity.to_string(), "0.030");
    }
}
