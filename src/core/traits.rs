//! Core traits for ledger storage and order pricing
//!
//! These are the seams the transaction engine depends on, so that the
//! journaled in-memory ledger can be swapped for another backend and the
//! product catalog stays outside the core.

use crate::types::{
    Account, ExternalAddress, LedgerEntry, Mutation, Order, OrderId, TokenAmount, UserId,
    WalletError,
};

/// Durable account balances and the append-only entry log
///
/// `apply_mutation` is the only balance write path. Implementations must run
/// it as one atomic unit that is exclusive per account and independent
/// across accounts.
pub trait LedgerStore: Send + Sync {
    /// Create the account for a newly registered user
    ///
    /// Idempotent: an existing account is returned unchanged.
    fn open_account(&self, user: UserId) -> Result<Account, WalletError>;

    /// Fetch a snapshot of an account
    fn get_account(&self, user: UserId) -> Result<Account, WalletError>;

    /// Apply one balance mutation as a single unit of work
    ///
    /// Locks the account, recomputes both pools for the mutation kind, rejects
    /// overdrafts and reused external references, then appends the entry,
    /// updates the account and finalizes the referenced order together.
    /// On any error nothing is changed.
    fn apply_mutation(&self, user: UserId, mutation: Mutation) -> Result<LedgerEntry, WalletError>;

    /// Set the external address of an account; allowed at most once
    ///
    /// `from_ledger` is the first external ledger whose inbound payments are
    /// credited to the account. Rebinding the same address keeps the ledger
    /// recorded by the first binding.
    fn bind_external_address(
        &self,
        user: UserId,
        address: ExternalAddress,
        from_ledger: u64,
    ) -> Result<Account, WalletError>;

    /// Stop accepting mutations for an account; accounts are never deleted
    ///
    /// Refused with `AccountNotEmpty` while either pool holds tokens, so no
    /// balance is ever stranded on an inactive account. Deactivating an
    /// inactive account is a no-op.
    fn deactivate_account(&self, user: UserId) -> Result<Account, WalletError>;

    /// Resolve the owner of an external address
    fn find_by_address(&self, address: &ExternalAddress) -> Option<UserId>;

    /// All entries of an account, in commit order
    fn entries(&self, user: UserId) -> Result<Vec<LedgerEntry>, WalletError>;

    /// Persist a new pending order
    fn create_order(&self, order: Order) -> Result<Order, WalletError>;

    fn get_order(&self, order_id: OrderId) -> Result<Order, WalletError>;

    /// Move a pending order to `failed`
    fn fail_order(&self, order_id: OrderId) -> Result<Order, WalletError>;

    /// Snapshot of every account
    fn accounts(&self) -> Vec<Account>;
}

/// Product price lookup used to price order line items
///
/// Product search and inventory live outside the wallet; only the unit price
/// at purchase time matters here.
pub trait PriceCatalog: Send + Sync {
    fn unit_price(&self, item_id: &str) -> Option<TokenAmount>;
}
