//! Settlement gateway module
//!
//! All interaction with the external ledger network goes through the
//! `SettlementGateway` trait. The gateway owns no durable state; it can be
//! reconnected or replaced at any time.
//!
//! # Components
//!
//! - `rpc` - Lazily connected WebSocket JSON-RPC channel
//! - `xrpl` - Gateway backed by an XRPL node
//! - `simulated` - In-process gateway for explicit test and development mode

pub mod rpc;
pub mod simulated;
pub mod xrpl;

pub use simulated::{SendOutcome, SentPayment, SimulatedGateway};
pub use xrpl::{SigningSeed, XrplConfig, XrplGateway};

use crate::types::{
    ExternalAddress, ExternalBalance, ExternalPaymentEvent, PaymentReceipt, PaymentStatus,
    TokenAmount, TxHash, UserId, WalletError,
};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Capacity of the channel returned by `subscribe`
pub const EVENT_BUFFER: usize = 1024;

/// Client to the external ledger network
///
/// Implementations are constructed once per process and shared behind an
/// `Arc`. None of these calls may be made while an account row is locked.
#[async_trait]
pub trait SettlementGateway: Send + Sync {
    /// Best-effort balance lookup
    ///
    /// Never fails: an unreachable network yields `ExternalBalance::Unknown`.
    async fn query_balance(&self, address: &ExternalAddress) -> ExternalBalance;

    /// Sign, submit and await validation of an outbound payment
    ///
    /// # Errors
    ///
    /// * `SettlementFailed` - rejected by the network, or not validated within
    ///   the bounded wait. When the transaction was submitted, `tx_hash` is set
    ///   and the outcome must be treated as unknown.
    async fn send_payment(
        &self,
        amount: TokenAmount,
        destination: &ExternalAddress,
    ) -> Result<PaymentReceipt, WalletError>;

    /// Look up a previously submitted payment
    async fn payment_status(&self, tx_hash: &TxHash) -> Result<PaymentStatus, WalletError>;

    /// Index of the newest validated ledger
    ///
    /// # Errors
    ///
    /// * `SettlementFailed` - the network is unreachable
    async fn validated_ledger(&self) -> Result<u64, WalletError>;

    /// Start a long-lived watch on inbound payments to `address`
    ///
    /// Payments validated in ledgers before `from_ledger` are never
    /// delivered; with `None` the watch starts after the newest validated
    /// ledger. Events are delivered at least once; the background task
    /// reconnects on transport loss and resumes without gaps. It stops when
    /// the receiver is dropped or the gateway shuts down.
    fn subscribe(
        &self,
        address: ExternalAddress,
        from_ledger: Option<u64>,
    ) -> mpsc::Receiver<ExternalPaymentEvent>;

    /// Redirect target at the external top-up provider for `user`
    async fn topup_redirect(
        &self,
        user: UserId,
        address: Option<&ExternalAddress>,
    ) -> Result<String, WalletError>;

    /// Close connections and stop subscription tasks
    async fn shutdown(&self);
}

/// Build the top-up provider redirect for a user
pub(crate) fn topup_url(base: &str, user: UserId, address: Option<&ExternalAddress>) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    match address {
        Some(address) => format!("{}{}user={}&address={}", base, separator, user, address),
        None => format!("{}{}user={}", base, separator, user),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::plain("https://pay.example/topup", None, "https://pay.example/topup?user=5")]
    #[case::with_address(
        "https://pay.example/topup",
        Some("rXYZ"),
        "https://pay.example/topup?user=5&address=rXYZ"
    )]
    #[case::existing_query("https://pay.example/t?src=app", None, "https://pay.example/t?src=app&user=5")]
    fn test_topup_url(#[case] base: &str, #[case] address: Option<&str>, #[case] expected: &str) {
        let address = address.and_then(ExternalAddress::parse);
        assert_eq!(topup_url(base, UserId(5), address.as_ref()), expected);
    }
}
