//! Types module
//!
//! Contains core data structures used throughout the application.
//! This module organizes types into logical submodules:
//! - `account`: Account state and identifiers
//! - `ledger`: Ledger entries, mutation kinds and their balance deltas
//! - `order`: Orders and line items
//! - `settlement`: Records exchanged with the external settlement network
//! - `error`: Error types for the wallet engine

pub mod account;
pub mod error;
pub mod ledger;
pub mod order;
pub mod settlement;

pub use account::{Account, ExternalAddress, TokenAmount, UserId};
pub use error::{Pool, WalletError};
pub use ledger::{EntryId, EntryKind, LedgerEntry, Mutation, TxHash};
pub use order::{LineItem, Order, OrderId, OrderStatus};
pub use settlement::{
    ConfirmationStatus, ExternalBalance, ExternalPaymentEvent, PaymentReceipt, PaymentStatus,
};
