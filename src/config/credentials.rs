//! API credential management
//!
//! Depth snapshots and public depth streams need no authentication; the
//! credential surface exists for deployments that route through
//! authenticated endpoints. Secrets load from environment variables and are
//! masked everywhere they could be displayed.

use crate::exchange::Exchange;
use std::fmt;

/// Secure string wrapper that masks sensitive data in logs.
///
/// Debug output shows only `SecretString(***)`; Display shows the truncated
/// `first4...last4` form.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: String) -> Self {
        SecretString(value)
    }

    /// Returns the inner value. Only use at the point of an actual API
    /// call; never log the result.
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    /// Masked form safe for logging: `first4...last4`.
    pub fn masked(&self) -> String {
        let s = &self.0;
        if s.len() <= 8 {
            return "***".to_string();
        }
        format!("{}...{}", &s[..4], &s[s.len() - 4..])
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString(***)")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.masked())
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        SecretString::new(s)
    }
}

/// Per-exchange API credentials.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub api_key: SecretString,
    pub api_secret: SecretString,
}

impl Credentials {
    /// Load credentials for one exchange from the environment.
    ///
    /// Reads `{PREFIX}_API_KEY` and `{PREFIX}_API_SECRET` where the prefix
    /// is `BINANCE`, `OKX`, or `DERIBIT`. Returns `None` unless both are
    /// present and non-empty after trimming.
    pub fn from_env(exchange: Exchange) -> Option<Self> {
        let prefix = match exchange {
            Exchange::BinanceSpot | Exchange::BinanceFutures => "BINANCE",
            Exchange::OkxSpot | Exchange::OkxSwap => "OKX",
            Exchange::Deribit => "DERIBIT",
        };

        let read = |suffix: &str| -> Option<String> {
            std::env::var(format!("{}_{}", prefix, suffix))
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Some(Self {
            api_key: read("API_KEY")?.into(),
            api_secret: read("API_SECRET")?.into(),
        })
    }
}
