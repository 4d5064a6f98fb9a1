//! Core business logic module
//!
//! This module contains the wallet's bookkeeping components:
//! - `traits` - Trait abstractions for interchangeable implementations
//! - `engine` - Transaction orchestration (stake, orders, withdrawals, credits)
//! - `ledger_store` - Per-account locked balances and entry log
//! - `journal` - Write-ahead journal backing the ledger store
//! - `payouts` - Withdrawal payout tracking and retries
//! - `catalog` - Unit prices used to price orders

pub mod catalog;
pub mod engine;
pub mod journal;
pub mod ledger_store;
pub mod payouts;
pub mod traits;

pub use catalog::InMemoryCatalog;
pub use engine::{Balances, CartLine, WalletEngine, WalletOverview, Withdrawal};
pub use ledger_store::AccountLedger;
pub use payouts::{PayoutQueue, PayoutStatus, PayoutTask, WithdrawalMethod};
pub use traits::{LedgerStore, PriceCatalog};
