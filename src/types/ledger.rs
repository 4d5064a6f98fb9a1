//! Ledger entry types
//!
//! This module defines the append-only transaction log record, the kinds of
//! balance mutation, and the per-kind delta rules shared by the live store and
//! journal replay.

use super::account::{Account, TokenAmount, UserId};
use super::error::{Pool, WalletError};
use super::order::OrderId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ledger entry identifier
///
/// Allocated from a process-wide sequence, so ids also reflect commit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// External transaction hash, used as the idempotency key for credits
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(pub String);

impl TxHash {
    pub fn new(hash: impl Into<String>) -> Self {
        TxHash(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of balance mutation recorded in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// spendable -= amount, staked += amount
    Stake,

    /// staked -= amount, spendable += amount
    Unstake,

    /// spendable -= amount, paired with an order moving to `paid`
    OrderDebit,

    /// spendable += amount, confirmed by an off-chain payment provider
    TopupCredit,

    /// spendable -= amount, followed by an on-chain send
    WithdrawDebit,

    /// spendable += amount, from a confirmed inbound payment on the external ledger
    ExternalCredit,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Stake => "stake",
            EntryKind::Unstake => "unstake",
            EntryKind::OrderDebit => "order_debit",
            EntryKind::TopupCredit => "topup_credit",
            EntryKind::WithdrawDebit => "withdraw_debit",
            EntryKind::ExternalCredit => "external_credit",
        }
    }

    /// Signed change this kind applies to (spendable, staked)
    pub fn deltas(&self, amount: TokenAmount) -> (i128, i128) {
        let amount = i128::from(amount);
        match self {
            EntryKind::Stake => (-amount, amount),
            EntryKind::Unstake => (amount, -amount),
            EntryKind::OrderDebit | EntryKind::WithdrawDebit => (-amount, 0),
            EntryKind::TopupCredit | EntryKind::ExternalCredit => (amount, 0),
        }
    }

    /// Compute the pools that result from applying this kind to `account`
    ///
    /// Pure: the account is not modified. Returns `(spendable, staked)` or
    /// the error that must abort the unit of work.
    ///
    /// # Errors
    ///
    /// * `InsufficientBalance` - a pool would go negative
    /// * `ArithmeticOverflow` - a pool would exceed `u64::MAX`
    pub fn apply_to(
        &self,
        account: &Account,
        amount: TokenAmount,
    ) -> Result<(TokenAmount, TokenAmount), WalletError> {
        let user = account.user_id;
        let debit = |pool: Pool, balance: TokenAmount| {
            balance
                .checked_sub(amount)
                .ok_or_else(|| WalletError::insufficient_balance(user, pool, balance, amount))
        };
        let credit = |balance: TokenAmount| {
            balance
                .checked_add(amount)
                .ok_or_else(|| WalletError::arithmetic_overflow(self.as_str(), user))
        };

        match self {
            EntryKind::Stake => Ok((
                debit(Pool::Spendable, account.spendable)?,
                credit(account.staked)?,
            )),
            EntryKind::Unstake => Ok((
                credit(account.spendable)?,
                debit(Pool::Staked, account.staked)?,
            )),
            EntryKind::OrderDebit | EntryKind::WithdrawDebit => {
                Ok((debit(Pool::Spendable, account.spendable)?, account.staked))
            }
            EntryKind::TopupCredit | EntryKind::ExternalCredit => {
                Ok((credit(account.spendable)?, account.staked))
            }
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested balance mutation, the input to `LedgerStore::apply_mutation`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub kind: EntryKind,
    pub amount: TokenAmount,

    /// Idempotency key; a reused key is rejected with `DuplicateSettlement`
    pub external_ref: Option<TxHash>,

    /// Pending order finalized to `paid` in the same unit of work
    pub order_id: Option<OrderId>,
}

impl Mutation {
    pub fn new(kind: EntryKind, amount: TokenAmount) -> Self {
        Mutation {
            kind,
            amount,
            external_ref: None,
            order_id: None,
        }
    }

    pub fn with_external_ref(mut self, external_ref: TxHash) -> Self {
        self.external_ref = Some(external_ref);
        self
    }

    pub fn for_order(mut self, order_id: OrderId) -> Self {
        self.order_id = Some(order_id);
        self
    }
}

/// Persisted, immutable ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub user_id: UserId,
    pub kind: EntryKind,

    /// Always positive; direction is implied by `kind`
    pub amount: TokenAmount,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<TxHash>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<OrderId>,

    /// Spendable pool right after this entry was applied
    pub spendable_after: TokenAmount,
    /// Staked pool right after this entry was applied
    pub staked_after: TokenAmount,

    pub created_at: DateTime<Utc>,
}
