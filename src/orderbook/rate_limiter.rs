//! Weighted snapshot request admission
//!
//! Exchanges price REST requests in weight units against a moving per-minute
//! budget (Binance: 1200/min, depth snapshots cost 50 or 250). The limiter
//! keeps one sliding window per exchange behind a mutex; `acquire` blocks the
//! calling worker until the requested weight fits. Upstream punishment
//! responses (418/429) raise a per-exchange backoff multiplier that snapshot
//! retries consult.

use crate::exchange::Exchange;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Sliding window length for all exchanges.
const WINDOW: Duration = Duration::from_secs(60);

/// Ceiling on the 418 (IP ban) backoff multiplier.
const BAN_PENALTY_CAP: f64 = 8.0;

/// Ceiling on the 429 (too many requests) backoff multiplier.
const THROTTLE_PENALTY_CAP: f64 = 4.0;

/// Maximum startup jitter applied before a symbol's first snapshot request.
const STARTUP_JITTER_MAX_MS: u64 = 9_000;

#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("exchange {0} is not registered with the limiter")]
    UnknownExchange(Exchange),

    #[error("request weight {weight} exceeds the {ceiling} ceiling and can never be granted")]
    WeightExceedsCeiling { weight: u32, ceiling: u32 },
}

struct ExchangeWindow {
    ceiling: u32,
    period: Duration,
    entries: VecDeque<(Instant, u32)>,
    used: u32,
    penalty: f64,
}

impl ExchangeWindow {
    fn new(ceiling: u32, period: Duration) -> Self {
        Self {
            ceiling,
            period,
            entries: VecDeque::new(),
            used: 0,
            penalty: 1.0,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(at, weight)) = self.entries.front() {
            if now.duration_since(at) < self.period {
                break;
            }
            self.entries.pop_front();
            self.used -= weight;
        }
    }

    /// Time until enough of the oldest entries expire for `weight` to fit.
    fn next_free(&self, weight: u32, now: Instant) -> Duration {
        let mut freed = 0u32;
        for &(at, entry_weight) in &self.entries {
            freed += entry_weight;
            if self.used - freed + weight <= self.ceiling {
                return (at + self.period).saturating_duration_since(now);
            }
        }
        self.period
    }
}

/// Process-wide snapshot admission, shared by every symbol worker.
pub struct WeightLimiter {
    windows: Mutex<HashMap<Exchange, ExchangeWindow>>,
}

impl WeightLimiter {
    /// Limiter with the default per-exchange ceilings over a 60 s window.
    pub fn new() -> Self {
        let windows = Exchange::ALL
            .iter()
            .map(|&ex| {
                (
                    ex,
                    ExchangeWindow::new(ex.default_weight_ceiling(), WINDOW),
                )
            })
            .collect();
        Self {
            windows: Mutex::new(windows),
        }
    }

    /// Limiter with a custom ceiling and window for one exchange (tests and
    /// non-default deployments).
    pub fn with_ceiling(exchange: Exchange, ceiling: u32, period: Duration) -> Self {
        let limiter = Self::new();
        limiter
            .windows
            .lock()
            .expect("limiter mutex poisoned")
            .insert(exchange, ExchangeWindow::new(ceiling, period));
        limiter
    }

    /// Block until `weight` fits in the exchange's window, then record it.
    pub async fn acquire(&self, exchange: Exchange, weight: u32) -> Result<(), LimiterError> {
        loop {
            let wait = {
                let mut windows = self.windows.lock().expect("limiter mutex poisoned");
                let window = windows
                    .get_mut(&exchange)
                    .ok_or(LimiterError::UnknownExchange(exchange))?;

                if weight > window.ceiling {
                    return Err(LimiterError::WeightExceedsCeiling {
                        weight,
                        ceiling: window.ceiling,
                    });
                }

                let now = Instant::now();
                window.prune(now);
                if window.used + weight <= window.ceiling {
                    window.entries.push_back((now, weight));
                    window.used += weight;
                    return Ok(());
                }
                window.next_free(weight, now)
            };

            debug!(
                exchange = %exchange,
                weight,
                wait_ms = wait.as_millis() as u64,
                "weight budget exhausted, waiting"
            );
            sleep(wait).await;
        }
    }

    /// Record an upstream punishment response. 418 doubles the backoff
    /// multiplier (capped 8x), 429 raises it by half (capped 4x).
    pub fn note_http_status(&self, exchange: Exchange, status: u16) {
        let (factor, cap) = match status {
            418 => (2.0, BAN_PENALTY_CAP),
            429 => (1.5, THROTTLE_PENALTY_CAP),
            _ => return,
        };

        let mut windows = self.windows.lock().expect("limiter mutex poisoned");
        if let Some(window) = windows.get_mut(&exchange) {
            let raised = (window.penalty * factor).min(cap);
            window.penalty = window.penalty.max(raised);
            warn!(
                exchange = %exchange,
                status,
                penalty = window.penalty,
                "upstream rate punishment, backoff multiplier raised"
            );
        }
    }

    /// Reset the backoff multiplier after a successful request.
    pub fn note_success(&self, exchange: Exchange) {
        let mut windows = self.windows.lock().expect("limiter mutex poisoned");
        if let Some(window) = windows.get_mut(&exchange) {
            window.penalty = 1.0;
        }
    }

    /// Scale a retry backoff base by the exchange's current penalty.
    pub fn scaled_backoff(&self, exchange: Exchange, base: Duration) -> Duration {
        let windows = self.windows.lock().expect("limiter mutex poisoned");
        let penalty = windows.get(&exchange).map(|w| w.penalty).unwrap_or(1.0);
        base.mul_f64(penalty)
    }
}

impl Default for WeightLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Random 0-9 s delay before a symbol's first snapshot request, spreading
/// fleet startup across the weight window.
pub fn startup_jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..STARTUP_JITTER_MAX_MS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_within_budget_is_immediate() {
        let limiter = WeightLimiter::new();
        let start = Instant::now();

        // 24 x 50 = 1200 fits the Binance window exactly.
        for _ in 0..24 {
            limiter
                .acquire(Exchange::BinanceSpot, 50)
                .await
                .unwrap();
        }

        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_25th_snapshot_waits_a_full_window() {
        let limiter = WeightLimiter::new();
        let start = Instant::now();

        for _ in 0..24 {
            limiter
                .acquire(Exchange::BinanceSpot, 50)
                .await
                .unwrap();
        }
        limiter
            .acquire(Exchange::BinanceSpot, 50)
            .await
            .unwrap();

        // The 25th grant waits for the first window entry to expire.
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert!(start.elapsed() < Duration::from_secs(61));
    }

    #[tokio::test(start_paused = true)]
    async fn test_thirty_requests_all_eventually_granted() {
        let limiter = WeightLimiter::new();
        for _ in 0..30 {
            limiter
                .acquire(Exchange::BinanceSpot, 50)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_oversized_weight_rejected() {
        let limiter = WeightLimiter::with_ceiling(
            Exchange::OkxSpot,
            10,
            Duration::from_secs(1),
        );
        let err = limiter.acquire(Exchange::OkxSpot, 11).await.unwrap_err();
        assert!(matches!(err, LimiterError::WeightExceedsCeiling { .. }));
    }

    #[test]
    fn test_penalty_multipliers_and_caps() {
        let limiter = WeightLimiter::new();
        let base = Duration::from_secs(1);

        limiter.note_http_status(Exchange::BinanceSpot, 429);
        assert_eq!(
            limiter.scaled_backoff(Exchange::BinanceSpot, base),
            Duration::from_millis(1500)
        );

        for _ in 0..5 {
            limiter.note_http_status(Exchange::BinanceSpot, 418);
        }
        // 418 doubles but is capped at 8x.
        assert_eq!(
            limiter.scaled_backoff(Exchange::BinanceSpot, base),
            Duration::from_secs(8)
        );

        // A later 429 must not lower an already higher multiplier.
        limiter.note_http_status(Exchange::BinanceSpot, 429);
        assert_eq!(
            limiter.scaled_backoff(Exchange::BinanceSpot, base),
            Duration::from_secs(8)
        );

        limiter.note_success(Exchange::BinanceSpot);
        assert_eq!(limiter.scaled_backoff(Exchange::BinanceSpot, base), base);
    }

    #[test]
    fn test_startup_jitter_bounds() {
        for _ in 0..100 {
            assert!(startup_jitter() < Duration::from_secs(9));
        }
    }
}
