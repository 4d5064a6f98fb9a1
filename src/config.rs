//! Service configuration
//!
//! Built from the command line (with environment fallbacks) by
//! `cli::ServeArgs::to_service_config`. Invalid numeric settings fall back
//! to their defaults with a warning; a missing custody key outside simulated
//! mode is a hard error.

use crate::settlement::XrplConfig;
use rust_decimal::Decimal;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8080";
pub const DEFAULT_XRPL_URL: &str = "wss://s.altnet.rippletest.net:51233";
pub const DEFAULT_TOPUP_URL: &str = "https://topup.example.com/checkout";
/// 5%
pub const DEFAULT_APY: Decimal = Decimal::from_parts(5, 0, 0, false, 2);

/// Which settlement gateway the service talks to
#[derive(Debug, Clone)]
pub enum GatewayConfig {
    Xrpl(XrplConfig),
    /// In-process gateway; never touches a real network
    Simulated { topup_url: String },
}

/// Shared secret the top-up provider presents on its confirmation webhook
///
/// Never printed; `Debug` is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct WebhookSecret(String);

impl WebhookSecret {
    /// `None` for an empty or blank secret
    pub fn new(secret: &str) -> Option<Self> {
        let secret = secret.trim();
        if secret.is_empty() {
            None
        } else {
            Some(WebhookSecret(secret.to_string()))
        }
    }

    /// Compare with a presented token without stopping at the first mismatch
    pub fn matches(&self, presented: &str) -> bool {
        let expected = self.0.as_bytes();
        let presented = presented.as_bytes();
        expected.len() == presented.len()
            && expected
                .iter()
                .zip(presented)
                .fold(0u8, |diff, (a, b)| diff | (a ^ b))
                == 0
    }
}

impl fmt::Debug for WebhookSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WebhookSecret(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutConfig {
    pub max_attempts: u32,
    pub retry_interval: Duration,
    /// Minimum age of an unconfirmed payout before it is re-checked
    pub recheck_after: Duration,
}

impl Default for PayoutConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_interval: Duration::from_secs(60),
            recheck_after: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub listen: SocketAddr,
    /// Tokio worker threads
    pub workers: usize,
    /// Write-ahead journal; `None` keeps the ledger in memory only
    pub journal: Option<PathBuf>,
    /// `fsync` every journal append
    pub journal_sync: bool,
    /// JSON price list for order confirmation
    pub catalog: Option<PathBuf>,
    pub apy: Decimal,
    pub gateway: GatewayConfig,
    pub payouts: PayoutConfig,
    /// `None` disables the top-up confirmation webhook
    pub topup_webhook_secret: Option<WebhookSecret>,
}

impl ServiceConfig {
    pub fn is_simulated(&self) -> bool {
        matches!(self.gateway, GatewayConfig::Simulated { .. })
    }
}
