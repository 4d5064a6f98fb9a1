use crate::config::{
    GatewayConfig, PayoutConfig, ServiceConfig, WebhookSecret, DEFAULT_APY, DEFAULT_LISTEN,
    DEFAULT_TOPUP_URL, DEFAULT_XRPL_URL,
};
use crate::settlement::{SigningSeed, XrplConfig};
use crate::types::{ExternalAddress, WalletError};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Custodial wallet ledger with XRPL settlement
#[derive(Parser, Debug)]
#[command(name = "wallet-ledger-engine")]
#[command(about = "Custodial wallet ledger with XRPL settlement", long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP service, reconciliation watcher and payout loop
    Serve(ServeArgs),
    /// Print a CSV snapshot of every account in a journal
    Report(ReportArgs),
}

/// Available settlement gateways
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum GatewayKind {
    Xrpl,
    Simulated,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(long, env = "WALLET_LISTEN", default_value = DEFAULT_LISTEN, help = "Address the HTTP API binds to")]
    pub listen: SocketAddr,

    #[arg(long, env = "WALLET_WORKERS", value_name = "COUNT", help = "Runtime worker threads (default: CPU cores)")]
    pub workers: Option<usize>,

    #[arg(long, env = "WALLET_JOURNAL", value_name = "PATH", help = "Ledger journal file (in-memory ledger if absent)")]
    pub journal: Option<PathBuf>,

    #[arg(long, env = "WALLET_JOURNAL_SYNC", help = "fsync the journal after every commit")]
    pub journal_sync: bool,

    #[arg(long, env = "WALLET_CATALOG", value_name = "PATH", help = "JSON object of item id to unit price")]
    pub catalog: Option<PathBuf>,

    #[arg(long, env = "WALLET_APY", value_name = "RATE", help = "Staking APY shown in the wallet overview (default: 0.05)")]
    pub apy: Option<Decimal>,

    #[arg(long, env = "WALLET_GATEWAY", value_enum, default_value = "xrpl", help = "Settlement gateway: 'xrpl' or 'simulated'")]
    pub gateway: GatewayKind,

    #[arg(long, env = "XRPL_URL", default_value = DEFAULT_XRPL_URL, help = "WebSocket endpoint of the XRPL node")]
    pub xrpl_url: String,

    #[arg(long, env = "XRPL_SENDER_ADDRESS", value_name = "ADDRESS", help = "Custody wallet withdrawals are paid from")]
    pub xrpl_sender: Option<String>,

    #[arg(long, env = "XRPL_SENDER_SEED", hide_env_values = true, value_name = "SEED", help = "Signing seed of the custody wallet")]
    pub xrpl_seed: Option<String>,

    #[arg(long, value_name = "SECS", help = "Per-request timeout against the node (default: 10)")]
    pub request_timeout_secs: Option<u64>,

    #[arg(long, value_name = "SECS", help = "Wait for a payment to validate (default: 30)")]
    pub confirmation_timeout_secs: Option<u64>,

    #[arg(long, value_name = "SECS", help = "Delay before resubscribing after a lost connection (default: 5)")]
    pub reconnect_delay_secs: Option<u64>,

    #[arg(long, env = "TOPUP_URL", default_value = DEFAULT_TOPUP_URL, help = "Base URL of the top-up provider")]
    pub topup_url: String,

    #[arg(long, env = "TOPUP_WEBHOOK_SECRET", hide_env_values = true, value_name = "SECRET", help = "Shared secret of the top-up confirmation webhook (disabled if absent)")]
    pub topup_webhook_secret: Option<String>,

    #[arg(long, value_name = "COUNT", help = "Payout attempts before operator hand-off (default: 5)")]
    pub payout_max_attempts: Option<u32>,

    #[arg(long, value_name = "SECS", help = "Interval of the payout retry loop (default: 60)")]
    pub payout_retry_secs: Option<u64>,
}

#[derive(Args, Debug)]
pub struct ReportArgs {
    #[arg(long, env = "WALLET_JOURNAL", value_name = "PATH", help = "Ledger journal file to read")]
    pub journal: PathBuf,
}

/// Use `value` unless it is zero, warning about the fallback
fn positive_or<T>(name: &str, value: Option<T>, default: T) -> T
where
    T: PartialEq + Default + std::fmt::Display + Copy,
{
    match value {
        Some(value) if value == T::default() => {
            warn!("Invalid {} ({}), using default ({})", name, value, default);
            default
        }
        Some(value) => value,
        None => default,
    }
}

impl ServeArgs {
    /// Build a ServiceConfig from CLI arguments
    ///
    /// Numeric options fall back to their defaults when absent or zero
    /// (with a warning). The custody sender address and seed are mandatory
    /// unless the simulated gateway is selected.
    ///
    /// # Errors
    ///
    /// * `Config` - the xrpl gateway is selected without a sender address or seed
    pub fn to_service_config(&self) -> Result<ServiceConfig, WalletError> {
        let default_payouts = PayoutConfig::default();

        let apy = match self.apy {
            Some(apy) if apy.is_sign_negative() => {
                warn!("Invalid apy ({}), using default ({})", apy, DEFAULT_APY);
                DEFAULT_APY
            }
            Some(apy) => apy,
            None => DEFAULT_APY,
        };

        let gateway = match self.gateway {
            GatewayKind::Simulated => GatewayConfig::Simulated {
                topup_url: self.topup_url.clone(),
            },
            GatewayKind::Xrpl => {
                let sender = self
                    .xrpl_sender
                    .as_deref()
                    .and_then(ExternalAddress::parse)
                    .ok_or_else(|| WalletError::config("XRPL_SENDER_ADDRESS is required for the xrpl gateway"))?;
                let seed = self
                    .xrpl_seed
                    .as_deref()
                    .and_then(SigningSeed::new)
                    .ok_or_else(|| WalletError::config("XRPL_SENDER_SEED is required for the xrpl gateway"))?;

                GatewayConfig::Xrpl(XrplConfig {
                    url: self.xrpl_url.clone(),
                    sender,
                    seed,
                    request_timeout: Duration::from_secs(positive_or("request_timeout_secs", self.request_timeout_secs, 10)),
                    confirmation_timeout: Duration::from_secs(positive_or(
                        "confirmation_timeout_secs",
                        self.confirmation_timeout_secs,
                        30,
                    )),
                    poll_interval: Duration::from_secs(1),
                    reconnect_delay: Duration::from_secs(positive_or("reconnect_delay_secs", self.reconnect_delay_secs, 5)),
                    topup_url: self.topup_url.clone(),
                })
            }
        };

        Ok(ServiceConfig {
            listen: self.listen,
            workers: positive_or("workers", self.workers, num_cpus::get()),
            journal: self.journal.clone(),
            journal_sync: self.journal_sync,
            catalog: self.catalog.clone(),
            apy,
            gateway,
            payouts: PayoutConfig {
                max_attempts: positive_or("payout_max_attempts", self.payout_max_attempts, default_payouts.max_attempts),
                retry_interval: Duration::from_secs(positive_or(
                    "payout_retry_secs",
                    self.payout_retry_secs,
                    default_payouts.retry_interval.as_secs(),
                )),
                recheck_after: default_payouts.recheck_after,
            },
            topup_webhook_secret: self.topup_webhook_secret.as_deref().and_then(WebhookSecret::new),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn serve(args: &[&str]) -> ServeArgs {
        let mut full = vec!["wallet-ledger-engine", "serve"];
        full.extend_from_slice(args);
        match CliArgs::try_parse_from(full).unwrap().command {
            Command::Serve(serve) => serve,
            other => panic!("expected serve, got {:?}", other),
        }
    }

    const SIMULATED: &[&str] = &["--gateway", "simulated"];

    #[rstest]
    #[case::default_gateway(&[], GatewayKind::Xrpl)]
    #[case::explicit_simulated(&["--gateway", "simulated"], GatewayKind::Simulated)]
    #[case::explicit_xrpl(&["--gateway", "xrpl"], GatewayKind::Xrpl)]
    fn test_gateway_parsing(#[case] args: &[&str], #[case] expected: GatewayKind) {
        assert_eq!(serve(args).gateway, expected);
    }

    #[test]
    fn test_report_parsing() {
        let parsed = CliArgs::try_parse_from(["wallet-ledger-engine", "report", "--journal", "ledger.jsonl"]).unwrap();
        match parsed.command {
            Command::Report(report) => assert_eq!(report.journal, PathBuf::from("ledger.jsonl")),
            other => panic!("expected report, got {:?}", other),
        }
    }

    #[rstest]
    #[case::missing_both(&[])]
    #[case::missing_seed(&["--xrpl-sender", "rCustody"])]
    #[case::missing_sender(&["--xrpl-seed", "sSecret"])]
    #[case::blank_seed(&["--xrpl-sender", "rCustody", "--xrpl-seed", "  "])]
    fn test_xrpl_without_custody_key_fails(#[case] args: &[&str]) {
        if std::env::var("XRPL_SENDER_ADDRESS").is_ok() || std::env::var("XRPL_SENDER_SEED").is_ok() {
            return;
        }
        let error = serve(args).to_service_config().unwrap_err();
        assert!(matches!(error, WalletError::Config { .. }));
    }

    #[test]
    fn test_xrpl_with_custody_key_builds_config() {
        let config = serve(&["--xrpl-sender", "rCustody", "--xrpl-seed", "sSecret", "--confirmation-timeout-secs", "45"])
            .to_service_config()
            .unwrap();

        match config.gateway {
            GatewayConfig::Xrpl(xrpl) => {
                assert_eq!(xrpl.sender.as_str(), "rCustody");
                assert_eq!(xrpl.confirmation_timeout, Duration::from_secs(45));
                assert_eq!(xrpl.request_timeout, Duration::from_secs(10));
            }
            other => panic!("expected xrpl gateway, got {:?}", other),
        }
    }

    #[test]
    fn test_simulated_needs_no_custody_key() {
        let config = serve(SIMULATED).to_service_config().unwrap();
        assert!(config.is_simulated());
    }

    #[rstest]
    #[case::absent(&[], false)]
    #[case::blank(&["--topup-webhook-secret", " "], false)]
    #[case::set(&["--topup-webhook-secret", "whsec_1"], true)]
    fn test_topup_webhook_secret(#[case] args: &[&str], #[case] enabled: bool) {
        if std::env::var("TOPUP_WEBHOOK_SECRET").is_ok() {
            return;
        }
        let mut full = SIMULATED.to_vec();
        full.extend_from_slice(args);
        let config = serve(&full).to_service_config().unwrap();

        assert_eq!(config.topup_webhook_secret.is_some(), enabled);
    }

    #[rstest]
    #[case::all_defaults(&[], num_cpus::get(), 5)]
    #[case::custom_workers(&["--workers", "3"], 3, 5)]
    #[case::custom_attempts(&["--payout-max-attempts", "2"], num_cpus::get(), 2)]
    #[case::zero_workers_fallback(&["--workers", "0"], num_cpus::get(), 5)]
    #[case::zero_attempts_fallback(&["--payout-max-attempts", "0"], num_cpus::get(), 5)]
    fn test_numeric_options_fall_back_to_defaults(
        #[case] args: &[&str],
        #[case] expected_workers: usize,
        #[case] expected_attempts: u32,
    ) {
        if std::env::var("WALLET_WORKERS").is_ok() {
            return;
        }
        let mut full = SIMULATED.to_vec();
        full.extend_from_slice(args);
        let config = serve(&full).to_service_config().unwrap();

        assert_eq!(config.workers, expected_workers);
        assert_eq!(config.payouts.max_attempts, expected_attempts);
    }

    #[rstest]
    #[case::default_apy(&[], "0.05")]
    #[case::custom_apy(&["--apy", "0.12"], "0.12")]
    #[case::negative_apy_fallback(&["--apy=-0.1"], "0.05")]
    fn test_apy(#[case] args: &[&str], #[case] expected: &str) {
        if std::env::var("WALLET_APY").is_ok() {
            return;
        }
        let mut full = SIMULATED.to_vec();
        full.extend_from_slice(args);
        let config = serve(&full).to_service_config().unwrap();

        assert_eq!(config.apy.to_string(), expected);
    }
}
