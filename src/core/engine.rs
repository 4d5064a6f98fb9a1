//! Wallet transaction engine
//!
//! This module provides the `WalletEngine` that orchestrates balance changes
//! by coordinating the `LedgerStore`, the `SettlementGateway`, the price
//! catalog and the payout queue.
//!
//! The engine enforces business rules such as:
//! - Positive amounts only, rejected before touching storage
//! - One `apply_mutation` call per operation, so each operation commits or
//!   fails as a whole
//! - Order finalization together with its debit (`pending -> paid`), and
//!   `pending -> failed` when the debit is refused
//! - Withdrawals debit first and pay out afterwards, without holding any
//!   account lock during network calls

use crate::core::payouts::{PayoutQueue, PayoutStatus, WithdrawalMethod};
use crate::core::traits::{LedgerStore, PriceCatalog};
use crate::settlement::SettlementGateway;
use crate::types::{
    Account, EntryKind, ExternalAddress, LedgerEntry, LineItem, Mutation, Order, OrderId, Pool,
    TokenAmount, TxHash, UserId, WalletError,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Both pools of an account after an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Balances {
    pub spendable: TokenAmount,
    pub staked: TokenAmount,
}

impl From<&Account> for Balances {
    fn from(account: &Account) -> Self {
        Balances {
            spendable: account.spendable,
            staked: account.staked,
        }
    }
}

/// Pools as committed by the entry, unaffected by later mutations
impl From<&LedgerEntry> for Balances {
    fn from(entry: &LedgerEntry) -> Self {
        Balances {
            spendable: entry.spendable_after,
            staked: entry.staked_after,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletOverview {
    pub spendable: TokenAmount,
    pub staked: TokenAmount,
    /// `None` when no address is bound or the network is unreachable
    pub external_balance: Option<TokenAmount>,
    pub apy: Decimal,
}

/// Requested quantity of a catalog item
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    pub item_id: String,
    pub quantity: u32,
}

/// Accepted withdrawal: the committed debit and the state of its payout
#[derive(Debug, Clone, PartialEq)]
pub struct Withdrawal {
    pub entry: LedgerEntry,
    pub payout: PayoutStatus,
}

/// Wallet transaction engine
///
/// Cheap to clone; all clones share the same store, gateway and queue.
#[derive(Clone)]
pub struct WalletEngine {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn SettlementGateway>,
    catalog: Arc<dyn PriceCatalog>,
    payouts: Arc<PayoutQueue>,
    apy: Decimal,
}

impl WalletEngine {
    /// Create a new WalletEngine
    ///
    /// # Arguments
    ///
    /// * `store` - Ledger store holding balances and entries
    /// * `gateway` - Client to the external settlement network
    /// * `catalog` - Unit prices for order line items
    /// * `payouts` - Queue tracking withdrawal payouts
    /// * `apy` - Staking yield reported in the wallet overview
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn SettlementGateway>,
        catalog: Arc<dyn PriceCatalog>,
        payouts: Arc<PayoutQueue>,
        apy: Decimal,
    ) -> Self {
        WalletEngine {
            store,
            gateway,
            catalog,
            payouts,
            apy,
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<dyn SettlementGateway> {
        &self.gateway
    }

    pub fn payouts(&self) -> &Arc<PayoutQueue> {
        &self.payouts
    }

    /// Registration hook: create the wallet of a new user
    pub fn open_account(&self, user: UserId) -> Result<Account, WalletError> {
        self.store.open_account(user)
    }

    /// Bind the user's external address (once)
    ///
    /// Inbound payments are credited from the first ledger after the newest
    /// validated one at bind time; earlier history of the address is never
    /// credited. The caller is responsible for starting a reconciliation
    /// watch from `Account::address_ledger`.
    ///
    /// # Errors
    ///
    /// * `SettlementFailed` - the validated ledger could not be fetched
    /// * `AddressAlreadyBound` / `AddressInUse` - see `LedgerStore`
    pub async fn link_external_address(
        &self,
        user: UserId,
        address: ExternalAddress,
    ) -> Result<Account, WalletError> {
        let current = self.store.get_account(user)?;
        if current.external_address.as_ref() == Some(&address) {
            return Ok(current);
        }

        let validated = self.gateway.validated_ledger().await?;
        let account = self
            .store
            .bind_external_address(user, address, validated.saturating_add(1))?;
        info!(
            user = %user,
            address = ?account.external_address,
            from_ledger = ?account.address_ledger,
            "External address linked"
        );
        Ok(account)
    }

    /// Deactivate an emptied wallet; the account and its history are kept
    ///
    /// # Errors
    ///
    /// * `NotFound` - the user has no account
    /// * `AccountNotEmpty` - either pool still holds tokens
    pub fn close_account(&self, user: UserId) -> Result<Account, WalletError> {
        let account = self.store.deactivate_account(user)?;
        info!(user = %user, "Account closed");
        Ok(account)
    }

    /// Both pools plus a best-effort external balance
    ///
    /// # Errors
    ///
    /// * `NotFound` - the user has no account
    pub async fn wallet_overview(&self, user: UserId) -> Result<WalletOverview, WalletError> {
        let account = self.store.get_account(user)?;

        let external_balance = match &account.external_address {
            Some(address) => self.gateway.query_balance(address).await.known(),
            None => None,
        };

        Ok(WalletOverview {
            spendable: account.spendable,
            staked: account.staked,
            external_balance,
            apy: self.apy,
        })
    }

    /// Move `amount` from spendable to staked
    ///
    /// # Errors
    ///
    /// * `InvalidAmount` - `amount` is zero
    /// * `InsufficientBalance` - spendable is below `amount`
    pub fn stake(&self, user: UserId, amount: TokenAmount) -> Result<Balances, WalletError> {
        self.move_between_pools(user, EntryKind::Stake, amount)
    }

    /// Move `amount` from staked back to spendable
    ///
    /// # Errors
    ///
    /// * `InvalidAmount` - `amount` is zero
    /// * `InsufficientBalance` - staked is below `amount`
    pub fn unstake(&self, user: UserId, amount: TokenAmount) -> Result<Balances, WalletError> {
        self.move_between_pools(user, EntryKind::Unstake, amount)
    }

    fn move_between_pools(
        &self,
        user: UserId,
        kind: EntryKind,
        amount: TokenAmount,
    ) -> Result<Balances, WalletError> {
        ensure_positive(amount)?;
        let entry = self.store.apply_mutation(user, Mutation::new(kind, amount))?;
        Ok(Balances::from(&entry))
    }

    /// Price a cart, record it as a pending order and pay for it
    ///
    /// The debit and the `pending -> paid` transition commit together. When
    /// the debit is refused the order is marked `failed` and the error is
    /// returned, so no paid order exists without its debit.
    ///
    /// # Errors
    ///
    /// * `InvalidAmount` - empty cart, zero quantity or zero total
    /// * `NotFound` - unknown account or catalog item
    /// * `InsufficientBalance` - the order total exceeds spendable
    pub fn confirm_order(&self, user: UserId, cart: Vec<CartLine>) -> Result<Order, WalletError> {
        let mut line_items = Vec::with_capacity(cart.len());
        for line in cart {
            let unit_price = self
                .catalog
                .unit_price(&line.item_id)
                .ok_or_else(|| WalletError::not_found("Item", &line.item_id))?;
            line_items.push(LineItem {
                item_id: line.item_id,
                quantity: line.quantity,
                unit_price,
            });
        }

        let order = Order::pending(user, line_items, Utc::now())?;
        self.store.get_account(user)?;
        let order = self.store.create_order(order)?;

        let debit = Mutation::new(EntryKind::OrderDebit, order.total).for_order(order.id);
        match self.store.apply_mutation(user, debit) {
            Ok(entry) => {
                info!(user = %user, order = %order.id, entry = %entry.id, total = order.total, "Order paid");
                self.store.get_order(order.id)
            }
            Err(e) => {
                warn!(user = %user, order = %order.id, error = %e, "Order payment refused");
                if let Err(fail_error) = self.store.fail_order(order.id) {
                    warn!(order = %order.id, error = %fail_error, "Could not mark order failed");
                }
                Err(e)
            }
        }
    }

    /// Debit spendable and hand the payout to the payout queue
    ///
    /// The debit is committed before any payout is attempted; the on-chain
    /// send runs in the background and its failure never reverses the debit.
    ///
    /// # Errors
    ///
    /// * `InvalidAmount` - `amount` is zero
    /// * `NotFound` - unknown account, or an xrpl withdrawal with neither an
    ///   explicit destination nor a bound address
    /// * `InsufficientBalance` - spendable is below `amount`
    pub async fn request_withdrawal(
        &self,
        user: UserId,
        amount: TokenAmount,
        method: WithdrawalMethod,
    ) -> Result<Withdrawal, WalletError> {
        ensure_positive(amount)?;
        let account = self.store.get_account(user)?;

        let destination = match &method {
            WithdrawalMethod::Xrpl {
                destination: Some(destination),
            } => Some(destination.clone()),
            WithdrawalMethod::Xrpl { destination: None } => Some(
                account
                    .external_address
                    .clone()
                    .ok_or_else(|| WalletError::not_found("External address for account", user))?,
            ),
            WithdrawalMethod::Bank => None,
        };

        // Fast rejection; the authoritative check runs inside apply_mutation
        if amount > account.spendable {
            return Err(WalletError::insufficient_balance(
                user,
                Pool::Spendable,
                account.spendable,
                amount,
            ));
        }

        let entry = self
            .store
            .apply_mutation(user, Mutation::new(EntryKind::WithdrawDebit, amount))?;
        info!(user = %user, entry = %entry.id, amount, "Withdrawal debited");

        let task = match destination {
            Some(destination) => {
                let task = self.payouts.enqueue(entry.id, user, amount, destination);
                let payouts = Arc::clone(&self.payouts);
                let gateway = Arc::clone(&self.gateway);
                let entry_id = entry.id;
                tokio::spawn(async move {
                    payouts.send(gateway.as_ref(), entry_id).await;
                });
                task
            }
            None => self.payouts.enqueue_manual(entry.id, user, amount),
        };

        Ok(Withdrawal {
            entry,
            payout: task.status,
        })
    }

    /// Redirect target at the top-up provider; no ledger change
    pub async fn request_topup(&self, user: UserId) -> Result<String, WalletError> {
        let account = self.store.get_account(user)?;
        self.gateway
            .topup_redirect(user, account.external_address.as_ref())
            .await
    }

    /// Credit a confirmed inbound payment, exactly once per transaction hash
    ///
    /// # Errors
    ///
    /// * `DuplicateSettlement` - `tx_hash` was already credited
    pub fn credit_external(
        &self,
        user: UserId,
        amount: TokenAmount,
        tx_hash: TxHash,
    ) -> Result<LedgerEntry, WalletError> {
        ensure_positive(amount)?;
        let entry = self.store.apply_mutation(
            user,
            Mutation::new(EntryKind::ExternalCredit, amount).with_external_ref(tx_hash),
        )?;
        info!(user = %user, entry = %entry.id, amount, hash = ?entry.external_ref, "External payment credited");
        Ok(entry)
    }

    /// Credit an off-chain top-up confirmed by the provider
    ///
    /// Idempotent on `provider_ref`, which shares the settlement reference
    /// space under a `topup:` prefix.
    pub fn credit_topup(
        &self,
        user: UserId,
        amount: TokenAmount,
        provider_ref: &str,
    ) -> Result<LedgerEntry, WalletError> {
        ensure_positive(amount)?;
        let provider_ref = provider_ref.trim();
        if provider_ref.is_empty() {
            return Err(WalletError::invalid_amount("top-up reference is required"));
        }

        let entry = self.store.apply_mutation(
            user,
            Mutation::new(EntryKind::TopupCredit, amount)
                .with_external_ref(TxHash::new(format!("topup:{}", provider_ref))),
        )?;
        info!(user = %user, entry = %entry.id, amount, "Top-up credited");
        Ok(entry)
    }

    /// An order of `user`; orders of other users are reported as not found
    pub fn order(&self, user: UserId, order_id: OrderId) -> Result<Order, WalletError> {
        let order = self.store.get_order(order_id)?;
        if order.user_id != user {
            return Err(WalletError::not_found("Order", order_id));
        }
        Ok(order)
    }

    /// The account's entries in commit order
    pub fn history(&self, user: UserId) -> Result<Vec<LedgerEntry>, WalletError> {
        self.store.entries(user)
    }
}

fn ensure_positive(amount: TokenAmount) -> Result<(), WalletError> {
    if amount == 0 {
        return Err(WalletError::invalid_amount("amount must be positive"));
    }
    Ok(())
}
