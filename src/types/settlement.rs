//! Records exchanged with the external settlement network

use super::account::{ExternalAddress, TokenAmount};
use super::ledger::TxHash;
use serde::{Deserialize, Serialize};

/// Confirmation state of an observed external payment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationStatus {
    /// Seen but not yet in a validated ledger
    Pending,
    /// Included in a validated ledger; final
    Confirmed,
}

/// Inbound payment observed on the external ledger
///
/// Transient: only the hash outlives the event, as the idempotency key of the
/// resulting `external_credit` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalPaymentEvent {
    pub tx_hash: TxHash,
    pub destination: ExternalAddress,
    pub amount: TokenAmount,
    pub status: ConfirmationStatus,

    /// Ledger the payment was validated in, used to resume after reconnects
    pub ledger_index: Option<u64>,
}

impl ExternalPaymentEvent {
    pub fn is_confirmed(&self) -> bool {
        self.status == ConfirmationStatus::Confirmed
    }
}

/// Result of a best-effort balance lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalBalance {
    Known(TokenAmount),
    /// The network could not be reached or returned an unusable answer
    Unknown,
}

impl ExternalBalance {
    pub fn known(&self) -> Option<TokenAmount> {
        match self {
            ExternalBalance::Known(amount) => Some(*amount),
            ExternalBalance::Unknown => None,
        }
    }
}

/// Outcome of a successful, validated outbound payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub tx_hash: TxHash,
}

/// State of a previously submitted payment, as reported by the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentStatus {
    /// Validated with a success result
    Validated,
    /// Validated (or permanently rejected) with a failure result
    Failed(String),
    /// Known to the network but not yet validated
    Pending,
    /// The network has no record of the transaction
    NotFound,
}
