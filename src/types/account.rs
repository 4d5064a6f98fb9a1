//! Account-related types for the wallet ledger
//!
//! This module defines the Account structure and the identifiers used to
//! address an account internally and on the external settlement network.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Token amount in the smallest token unit
///
/// Balances are unsigned so a negative balance is unrepresentable; every
/// mutation goes through checked arithmetic.
pub type TokenAmount = u64;

/// Internal user identifier, as resolved from the authenticated principal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address of an account on the external settlement network
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalAddress(String);

impl ExternalAddress {
    /// Build an address, trimming surrounding whitespace
    ///
    /// Returns `None` for an empty string. Format validation beyond that is
    /// left to the settlement network, which rejects malformed addresses.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExternalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// User wallet state
///
/// Holds the two off-chain pools and the optional external address. Accounts
/// are only ever mutated by the ledger store and are never deleted; an
/// account that is no longer in use is deactivated instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Owning user
    pub user_id: UserId,

    /// Tokens immediately usable for purchases or withdrawal
    pub spendable: TokenAmount,

    /// Tokens locked to earn yield
    ///
    /// Only `unstake` moves these back into the spendable pool.
    pub staked: TokenAmount,

    /// External settlement address, set at most once
    ///
    /// `None` for users that never linked an external wallet.
    pub external_address: Option<ExternalAddress>,

    /// First external ledger whose inbound payments belong to this account
    ///
    /// Recorded when the address is bound; payments validated earlier
    /// predate the link and are never credited. `None` for accounts bound
    /// before the ledger was tracked.
    #[serde(default)]
    pub address_ledger: Option<u64>,

    /// Whether the account accepts mutations
    pub active: bool,

    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Create a new active account with empty pools and no external address
    pub fn new(user_id: UserId, created_at: DateTime<Utc>) -> Self {
        Account {
            user_id,
            spendable: 0,
            staked: 0,
            external_address: None,
            address_ledger: None,
            active: true,
            created_at,
        }
    }

    /// Sum of both pools, `None` on overflow
    pub fn total(&self) -> Option<TokenAmount> {
        self.spendable.checked_add(self.staked)
    }
}
