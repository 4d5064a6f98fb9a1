//! Wallet Ledger Engine Library
//! # Overview
//!
//! Custodial wallet bookkeeping for a marketplace: every user holds a
//! spendable and a staked pool of tokens, orders are paid from the spendable
//! pool, and value enters and leaves the wallet through an external XRPL
//! settlement network.
//!
//! # Architecture
//!
//! - [`types`] - Core data types (Account, LedgerEntry, Order, settlement records)
//! - [`core`] - Business logic components:
//!   - [`core::ledger_store`] - Per-account locked balances, entries and orders
//!   - [`core::journal`] - Write-ahead journal the ledger is replayed from
//!   - [`core::engine`] - Stake, orders, withdrawals and credits
//!   - [`core::payouts`] - Outbound payout tracking and retries
//! - [`settlement`] - `SettlementGateway` over XRPL, plus a simulated gateway
//! - [`watcher`] - Credits confirmed inbound payments to their owners
//! - [`api`] - HTTP adapter over the engine
//! - [`cli`], [`config`], [`service`] - Process entry points and wiring
//! - [`io`] - CSV account reports
//!
//! # Invariants
//!
//! - Balances never go negative; a mutation that would is rejected whole.
//! - Every balance change is one ledger entry; balances are the sum of entries.
//! - A settlement reference (XRPL hash or top-up reference) is credited at most once.
//! - Network calls are never made while an account is locked.

pub mod api;
pub mod cli;
pub mod config;
pub mod core;
pub mod io;
pub mod service;
pub mod settlement;
pub mod types;
pub mod watcher;

pub use core::{AccountLedger, LedgerStore, PayoutQueue, WalletEngine};
pub use io::write_accounts_csv;
pub use settlement::{SettlementGateway, SimulatedGateway, XrplGateway};
pub use types::{
    Account, EntryId, EntryKind, ExternalAddress, LedgerEntry, Order, OrderId, OrderStatus,
    TokenAmount, TxHash, UserId, WalletError,
};
pub use watcher::ReconciliationWatcher;
