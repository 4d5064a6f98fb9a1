//! Error types for the wallet ledger engine
//!
//! This module defines every error a wallet operation can surface. Variants
//! carry enough context to log the failure and to map it onto a user-visible
//! rejection at the HTTP boundary.
//!
//! # Error Categories
//!
//! - **Validation**: invalid amounts, illegal order transitions (rejected before storage)
//! - **Balance**: insufficient balance, arithmetic overflow (authoritative, inside the unit of work)
//! - **Idempotency**: duplicate settlement references
//! - **Settlement**: external network failures
//! - **Storage**: the ledger store cannot persist; fatal for the request, retryable

use super::account::{ExternalAddress, TokenAmount, UserId};
use super::ledger::TxHash;
use super::order::{OrderId, OrderStatus};
use std::fmt;
use thiserror::Error;

/// Balance pool named in an `InsufficientBalance` error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    Spendable,
    Staked,
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pool::Spendable => f.write_str("spendable"),
            Pool::Staked => f.write_str("staked"),
        }
    }
}

/// Main error type for the wallet ledger engine
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WalletError {
    /// Non-positive or malformed input
    ///
    /// Rejected before touching storage; no balance changes.
    #[error("Invalid amount: {reason}")]
    InvalidAmount {
        /// What was wrong with the input
        reason: String,
    },

    /// A pool would go negative
    ///
    /// Raised by the authoritative check inside the unit of work.
    #[error("Insufficient {pool} balance for user {user}: available {available}, requested {requested}")]
    InsufficientBalance {
        user: UserId,
        pool: Pool,
        available: TokenAmount,
        requested: TokenAmount,
    },

    /// Unknown account, order or entry
    #[error("{entity} {id} not found")]
    NotFound {
        /// Kind of record that was looked up
        entity: String,
        id: String,
    },

    /// The external reference was already settled
    ///
    /// Benign for the reconciliation watcher, an error for direct callers.
    #[error("Settlement {external_ref} was already applied")]
    DuplicateSettlement { external_ref: TxHash },

    /// An external send or query could not complete
    ///
    /// `tx_hash` is set when the transaction was submitted, in which case the
    /// outcome is unknown rather than failed.
    #[error("Settlement failed: {reason}{}", tx_hash.as_ref().map(|h| format!(" (tx {})", h)).unwrap_or_default())]
    SettlementFailed {
        reason: String,
        tx_hash: Option<TxHash>,
    },

    /// The ledger store cannot persist or read state
    ///
    /// Fatal for the request; the caller may retry.
    #[error("Storage unavailable: {message}")]
    StorageUnavailable { message: String },

    /// A pool would exceed the representable range
    #[error("Arithmetic overflow in {operation} for user {user}")]
    ArithmeticOverflow { operation: String, user: UserId },

    /// The account was deactivated and no longer accepts mutations
    #[error("Account {user} is inactive")]
    AccountInactive { user: UserId },

    /// Deactivation refused while tokens remain in either pool
    #[error("Account {user} still holds {spendable} spendable and {staked} staked tokens")]
    AccountNotEmpty {
        user: UserId,
        spendable: TokenAmount,
        staked: TokenAmount,
    },

    /// The account already has a different external address
    #[error("Account {user} is already bound to external address {address}")]
    AddressAlreadyBound {
        user: UserId,
        address: ExternalAddress,
    },

    /// The external address belongs to another account
    #[error("External address {address} is bound to another account")]
    AddressInUse { address: ExternalAddress },

    #[error("Order {order_id} cannot move from {from} to {to}")]
    InvalidOrderTransition {
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    },

    /// No authenticated principal on the request
    #[error("Unauthorized")]
    Unauthorized,

    /// Invalid or incomplete service configuration
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl From<std::io::Error> for WalletError {
    fn from(error: std::io::Error) -> Self {
        WalletError::StorageUnavailable {
            message: error.to_string(),
        }
    }
}

// Helper functions for creating common errors

impl WalletError {
    pub fn invalid_amount(reason: impl Into<String>) -> Self {
        WalletError::InvalidAmount {
            reason: reason.into(),
        }
    }

    pub fn insufficient_balance(
        user: UserId,
        pool: Pool,
        available: TokenAmount,
        requested: TokenAmount,
    ) -> Self {
        WalletError::InsufficientBalance {
            user,
            pool,
            available,
            requested,
        }
    }

    pub fn not_found(entity: &str, id: impl fmt::Display) -> Self {
        WalletError::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }

    pub fn account_not_found(user: UserId) -> Self {
        Self::not_found("Account", user)
    }

    pub fn duplicate_settlement(external_ref: TxHash) -> Self {
        WalletError::DuplicateSettlement { external_ref }
    }

    pub fn settlement_failed(reason: impl Into<String>, tx_hash: Option<TxHash>) -> Self {
        WalletError::SettlementFailed {
            reason: reason.into(),
            tx_hash,
        }
    }

    pub fn storage_unavailable(message: impl Into<String>) -> Self {
        WalletError::StorageUnavailable {
            message: message.into(),
        }
    }

    pub fn arithmetic_overflow(operation: &str, user: UserId) -> Self {
        WalletError::ArithmeticOverflow {
            operation: operation.to_string(),
            user,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        WalletError::Config {
            message: message.into(),
        }
    }

    /// Whether the caller may retry the same request unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WalletError::StorageUnavailable { .. } | WalletError::SettlementFailed { .. }
        )
    }
}
