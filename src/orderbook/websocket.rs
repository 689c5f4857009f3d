//! Exchange depth stream clients
//!
//! One connection per exchange carries every subscribed symbol (Binance via
//! combined-stream URLs, OKX and Deribit via subscribe frames after
//! connect). Frames are decoded on the read loop and fanned out to the
//! per-symbol workers through the manager's router channel.
//!
//! Reconnection uses exponential backoff capped at 30 s. A heartbeat
//! timeout (no frame for 30 s) tears the connection down the same way; the
//! sequence validators downstream then observe the gap and resynchronize.

use crate::exchange::Exchange;
use crate::orderbook::decoder::decode;
use crate::orderbook::types::BookUpdate;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Maximum reconnection delay.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Reconnect when no frame arrives within this window.
    pub heartbeat_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
enum StreamError {
    #[error("websocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("no frame within heartbeat timeout")]
    HeartbeatTimeout,

    #[error("stream closed by peer")]
    Closed,

    #[error("update receiver dropped")]
    ReceiverGone,
}

/// WebSocket client for one exchange's combined depth streams.
pub struct ExchangeStream {
    exchange: Exchange,
    native_symbols: Vec<String>,
    update_tx: mpsc::UnboundedSender<BookUpdate>,
    decode_errors: Arc<AtomicU64>,
    cancel: CancellationToken,
    cfg: StreamConfig,
}

impl ExchangeStream {
    pub fn new(
        exchange: Exchange,
        native_symbols: Vec<String>,
        update_tx: mpsc::UnboundedSender<BookUpdate>,
        cancel: CancellationToken,
        cfg: StreamConfig,
    ) -> Self {
        Self {
            exchange,
            native_symbols,
            update_tx,
            decode_errors: Arc::new(AtomicU64::new(0)),
            cancel,
            cfg,
        }
    }

    /// Dropped-frame counter for the health surface.
    pub fn decode_errors(&self) -> Arc<AtomicU64> {
        self.decode_errors.clone()
    }

    /// Connection URL; Binance encodes the subscriptions in the query
    /// string.
    fn connect_url(&self) -> String {
        match self.exchange {
            Exchange::BinanceSpot | Exchange::BinanceFutures => {
                let streams: Vec<String> = self
                    .native_symbols
                    .iter()
                    .map(|s| format!("{}@depth@100ms", s.to_lowercase()))
                    .collect();
                format!("{}?streams={}", self.exchange.ws_url(), streams.join("/"))
            }
            Exchange::OkxSpot | Exchange::OkxSwap | Exchange::Deribit => {
                self.exchange.ws_url().to_string()
            }
        }
    }

    /// Subscribe frames sent after connect for exchanges that need them.
    fn subscribe_frames(&self) -> Vec<String> {
        match self.exchange {
            Exchange::BinanceSpot | Exchange::BinanceFutures => vec![],
            Exchange::OkxSpot | Exchange::OkxSwap => {
                let args: Vec<serde_json::Value> = self
                    .native_symbols
                    .iter()
                    .map(|s| serde_json::json!({"channel": "books", "instId": s}))
                    .collect();
                vec![serde_json::json!({"op": "subscribe", "args": args}).to_string()]
            }
            Exchange::Deribit => {
                let channels: Vec<String> = self
                    .native_symbols
                    .iter()
                    .map(|s| format!("book.{}.100ms", s))
                    .collect();
                vec![serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "method": "public/subscribe",
                    "params": {"channels": channels}
                })
                .to_string()]
            }
        }
    }

    /// Spawn the connection loop with automatic reconnection.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut retry: u32 = 0;
            loop {
                if self.cancel.is_cancelled() {
                    info!(exchange = %self.exchange, "stream cancelled, exiting");
                    return;
                }

                match self.connect_and_process().await {
                    Ok(()) => {
                        info!(exchange = %self.exchange, "stream closed, exiting");
                        return;
                    }
                    Err(StreamError::ReceiverGone) => {
                        info!(exchange = %self.exchange, "router gone, exiting stream");
                        return;
                    }
                    Err(err) => {
                        let delay = Duration::from_secs(2u64.saturating_pow(retry.min(5)))
                            .min(MAX_RECONNECT_DELAY);
                        warn!(
                            exchange = %self.exchange,
                            error = %err,
                            retry,
                            delay_secs = delay.as_secs(),
                            "stream disconnected, reconnecting"
                        );
                        retry += 1;
                        tokio::select! {
                            _ = self.cancel.cancelled() => return,
                            _ = sleep(delay) => {}
                        }
                    }
                }
            }
        })
    }

    async fn connect_and_process(&self) -> Result<(), StreamError> {
        let url = self.connect_url();
        info!(exchange = %self.exchange, url = %url, "connecting depth stream");

        let (ws_stream, _) = connect_async(&url).await?;
        info!(exchange = %self.exchange, symbols = self.native_symbols.len(), "stream connected");
        let (mut write, mut read) = ws_stream.split();

        for frame in self.subscribe_frames() {
            write.send(Message::text(frame)).await?;
        }

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                next = timeout(self.cfg.heartbeat_timeout, read.next()) => next,
            };

            let message = match next {
                Err(_) => {
                    warn!(
                        exchange = %self.exchange,
                        timeout_secs = self.cfg.heartbeat_timeout.as_secs(),
                        "heartbeat timeout"
                    );
                    return Err(StreamError::HeartbeatTimeout);
                }
                Ok(None) => return Err(StreamError::Closed),
                Ok(Some(message)) => message?,
            };

            match message {
                Message::Text(text) => match decode(self.exchange, text.as_str()) {
                    Ok(Some(update)) => {
                        debug!(
                            exchange = %self.exchange,
                            symbol = %update.symbol,
                            last_update_id = update.last_update_id,
                            "depth update received"
                        );
                        if self.update_tx.send(update).is_err() {
                            return Err(StreamError::ReceiverGone);
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        self.decode_errors.fetch_add(1, Ordering::Relaxed);
                        error!(exchange = %self.exchange, error = %err, "dropping malformed frame");
                    }
                },
                Message::Ping(payload) => {
                    if write.send(Message::Pong(payload)).await.is_err() {
                        return Err(StreamError::Closed);
                    }
                }
                Message::Pong(_) => {}
                Message::Close(frame) => {
                    info!(exchange = %self.exchange, frame = ?frame, "close frame received");
                    return Err(StreamError::Closed);
                }
                Message::Binary(_) => {
                    warn!(exchange = %self.exchange, "unexpected binary frame");
                }
                Message::Frame(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(exchange: Exchange, symbols: &[&str]) -> ExchangeStream {
        let (tx, _rx) = mpsc::unbounded_channel();
        ExchangeStream::new(
            exchange,
            symbols.iter().map(|s| s.to_string()).collect(),
            tx,
            CancellationToken::new(),
            StreamConfig::default(),
        )
    }

    #[test]
    fn test_binance_combined_stream_url() {
        let s = stream(Exchange::BinanceSpot, &["BTCUSDT", "ETHUSDT"]);
        assert_eq!(
            s.connect_url(),
            "wss://stream.binance.com:9443/stream?streams=btcusdt@depth@100ms/ethusdt@depth@100ms"
        );
        assert!(s.subscribe_frames().is_empty());
    }

    #[test]
    fn test_okx_subscribe_frame() {
        let s = stream(Exchange::OkxSwap, &["BTC-USDT-SWAP", "ETH-USDT-SWAP"]);
        assert_eq!(s.connect_url(), "wss://ws.okx.com:8443/ws/v5/public");

        let frames = s.subscribe_frames();
        assert_eq!(frames.len(), 1);
        let frame: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(frame["op"], "subscribe");
        assert_eq!(frame["args"][0]["channel"], "books");
        assert_eq!(frame["args"][1]["instId"], "ETH-USDT-SWAP");
    }

    #[test]
    fn test_deribit_subscribe_frame() {
        let s = stream(Exchange::Deribit, &["BTC-PERPETUAL"]);
        let frames = s.subscribe_frames();
        let frame: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(frame["method"], "public/subscribe");
        assert_eq!(frame["params"]["channels"][0], "book.BTC-PERPETUAL.100ms");
    }
}
