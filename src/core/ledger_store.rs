//! Journaled, thread-safe ledger store
//!
//! This module provides `AccountLedger`, the `LedgerStore` implementation used
//! by the service. Account rows live in memory behind per-row mutexes and every
//! committed change is appended to an optional `Journal` first.
//!
//! # Design
//!
//! Rows are kept as `Arc<Mutex<AccountRow>>` inside a `DashMap`. A mutation
//! clones the row handle out of the map (holding the shard lock only for that
//! lookup) and then locks the row itself for the whole unit of work. Mutations
//! on the same account therefore serialize on the row mutex, while mutations on
//! other accounts never wait on it.
//!
//! # Lock order
//!
//! ```text
//! account row  ->  orders shard  ->  settled refs shard  ->  journal writer
//! ```
//!
//! No path acquires these in the opposite direction.

use super::journal::{Journal, JournalRecord};
use super::traits::LedgerStore;
use crate::types::{
    Account, EntryId, EntryKind, ExternalAddress, LedgerEntry, Mutation, Order, OrderId,
    OrderStatus, TxHash, UserId, WalletError,
};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Account state plus its log, guarded together by one mutex
#[derive(Debug)]
struct AccountRow {
    account: Account,
    entries: Vec<LedgerEntry>,
}

/// Ledger store with per-account locking and write-ahead journaling
#[derive(Debug)]
pub struct AccountLedger {
    accounts: DashMap<UserId, Arc<Mutex<AccountRow>>>,

    /// Reverse index from external address to owner
    addresses: DashMap<ExternalAddress, UserId>,

    /// Every external reference already applied, with the entry that applied it
    settled_refs: DashMap<TxHash, EntryId>,

    orders: DashMap<OrderId, Order>,

    next_entry_id: AtomicU64,

    /// `None` runs the ledger purely in memory
    journal: Option<Journal>,
}

impl AccountLedger {
    /// Create an empty, memory-only ledger
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
            addresses: DashMap::new(),
            settled_refs: DashMap::new(),
            orders: DashMap::new(),
            next_entry_id: AtomicU64::new(1),
            journal: None,
        }
    }

    /// Open a journaled ledger, replaying whatever the journal already holds
    ///
    /// # Errors
    ///
    /// * `StorageUnavailable` - the journal cannot be read, or its history does
    ///   not replay cleanly
    pub fn open(path: &Path, sync: bool) -> Result<Self, WalletError> {
        let (journal, records) = Journal::open(path, sync)?;
        let replayed = records.len();

        let mut ledger = Self::new();
        for record in records {
            ledger.replay(record)?;
        }
        ledger.journal = Some(journal);

        info!(
            path = %path.display(),
            records = replayed,
            accounts = ledger.accounts.len(),
            "Ledger restored from journal"
        );
        Ok(ledger)
    }

    /// Rebuild a memory-only snapshot of a journal without writing to it
    ///
    /// Used for reporting against the journal of a running service.
    pub fn snapshot(path: &Path) -> Result<Self, WalletError> {
        let mut ledger = Self::new();
        for record in Journal::read(path)? {
            ledger.replay(record)?;
        }
        Ok(ledger)
    }

    fn persist(&self, record: JournalRecord) -> Result<(), WalletError> {
        match &self.journal {
            Some(journal) => journal.append(&record),
            None => Ok(()),
        }
    }

    fn row(&self, user: UserId) -> Result<Arc<Mutex<AccountRow>>, WalletError> {
        self.accounts
            .get(&user)
            .map(|row| Arc::clone(row.value()))
            .ok_or_else(|| WalletError::account_not_found(user))
    }

    /// Re-apply one journal record without writing it back
    fn replay(&mut self, record: JournalRecord) -> Result<(), WalletError> {
        let corrupt = |what: String| WalletError::storage_unavailable(format!("journal replay: {}", what));

        match record {
            JournalRecord::AccountOpened {
                user_id,
                created_at,
            } => {
                self.accounts.insert(
                    user_id,
                    Arc::new(Mutex::new(AccountRow {
                        account: Account::new(user_id, created_at),
                        entries: Vec::new(),
                    })),
                );
            }
            JournalRecord::AddressBound {
                user_id,
                address,
                from_ledger,
            } => {
                let row = self.row(user_id)?;
                let mut row = row.lock();
                row.account.external_address = Some(address.clone());
                row.account.address_ledger = from_ledger;
                self.addresses.insert(address, user_id);
            }
            JournalRecord::AccountDeactivated { user_id } => {
                self.row(user_id)?.lock().account.active = false;
            }
            JournalRecord::OrderCreated { order } => {
                self.orders.insert(order.id, order);
            }
            JournalRecord::OrderFailed { order_id } => {
                let mut order = self
                    .orders
                    .get_mut(&order_id)
                    .ok_or_else(|| corrupt(format!("unknown order {}", order_id)))?;
                order
                    .finalize(OrderStatus::Failed)
                    .map_err(|e| corrupt(e.to_string()))?;
            }
            JournalRecord::EntryCommitted { entry } => {
                let row = self.row(entry.user_id)?;
                let mut row = row.lock();
                let (spendable, staked) = entry
                    .kind
                    .apply_to(&row.account, entry.amount)
                    .map_err(|e| corrupt(format!("entry {} does not apply: {}", entry.id, e)))?;
                if (spendable, staked) != (entry.spendable_after, entry.staked_after) {
                    return Err(corrupt(format!(
                        "entry {} records balances ({}, {}) but replays to ({}, {})",
                        entry.id, entry.spendable_after, entry.staked_after, spendable, staked
                    )));
                }
                row.account.spendable = spendable;
                row.account.staked = staked;

                if let Some(external_ref) = &entry.external_ref {
                    self.settled_refs.insert(external_ref.clone(), entry.id);
                }
                if let Some(order_id) = entry.order_id {
                    let mut order = self
                        .orders
                        .get_mut(&order_id)
                        .ok_or_else(|| corrupt(format!("entry {} pays unknown order {}", entry.id, order_id)))?;
                    order
                        .finalize(OrderStatus::Paid)
                        .map_err(|e| corrupt(e.to_string()))?;
                }
                self.next_entry_id
                    .fetch_max(entry.id.0 + 1, Ordering::Relaxed);
                row.entries.push(entry);
            }
        }
        Ok(())
    }
}

impl Default for AccountLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerStore for AccountLedger {
    fn open_account(&self, user: UserId) -> Result<Account, WalletError> {
        match self.accounts.entry(user) {
            Entry::Occupied(existing) => Ok(existing.get().lock().account.clone()),
            Entry::Vacant(slot) => {
                let created_at = Utc::now();
                self.persist(JournalRecord::AccountOpened {
                    user_id: user,
                    created_at,
                })?;

                let account = Account::new(user, created_at);
                slot.insert(Arc::new(Mutex::new(AccountRow {
                    account: account.clone(),
                    entries: Vec::new(),
                })));
                info!(user = %user, "Account opened");
                Ok(account)
            }
        }
    }

    fn get_account(&self, user: UserId) -> Result<Account, WalletError> {
        Ok(self.row(user)?.lock().account.clone())
    }

    fn apply_mutation(&self, user: UserId, mutation: Mutation) -> Result<LedgerEntry, WalletError> {
        if mutation.amount == 0 {
            return Err(WalletError::invalid_amount("mutation amount must be positive"));
        }

        let row = self.row(user)?;
        let mut row = row.lock();

        if !row.account.active {
            return Err(WalletError::AccountInactive { user });
        }

        let (spendable, staked) = mutation.kind.apply_to(&row.account, mutation.amount)?;

        let order = match mutation.order_id {
            Some(order_id) => {
                let order = self
                    .orders
                    .get_mut(&order_id)
                    .ok_or_else(|| WalletError::not_found("Order", order_id))?;
                if order.user_id != user
                    || mutation.kind != EntryKind::OrderDebit
                    || order.total != mutation.amount
                {
                    return Err(WalletError::invalid_amount(format!(
                        "{} of {} does not settle order {}",
                        mutation.kind, mutation.amount, order_id
                    )));
                }
                // The stored order only changes once the journal has the entry
                let mut paid = order.value().clone();
                paid.finalize(OrderStatus::Paid)?;
                Some((order, paid))
            }
            None => None,
        };

        // Held until commit so a concurrent reuse of the same reference waits
        // for this unit and then sees it as settled.
        let reservation = match &mutation.external_ref {
            Some(external_ref) => match self.settled_refs.entry(external_ref.clone()) {
                Entry::Occupied(_) => {
                    return Err(WalletError::duplicate_settlement(external_ref.clone()))
                }
                Entry::Vacant(slot) => Some(slot),
            },
            None => None,
        };

        let entry = LedgerEntry {
            id: EntryId(self.next_entry_id.fetch_add(1, Ordering::Relaxed)),
            user_id: user,
            kind: mutation.kind,
            amount: mutation.amount,
            external_ref: mutation.external_ref,
            order_id: mutation.order_id,
            spendable_after: spendable,
            staked_after: staked,
            created_at: Utc::now(),
        };

        self.persist(JournalRecord::EntryCommitted {
            entry: entry.clone(),
        })?;

        if let Some(slot) = reservation {
            slot.insert(entry.id);
        }
        if let Some((mut stored, paid)) = order {
            *stored = paid;
        }
        row.account.spendable = spendable;
        row.account.staked = staked;
        row.entries.push(entry.clone());

        debug!(
            user = %user,
            entry = %entry.id,
            kind = %entry.kind,
            amount = entry.amount,
            spendable,
            staked,
            "Mutation committed"
        );
        Ok(entry)
    }

    fn bind_external_address(
        &self,
        user: UserId,
        address: ExternalAddress,
        from_ledger: u64,
    ) -> Result<Account, WalletError> {
        let row = self.row(user)?;
        let mut row = row.lock();

        match &row.account.external_address {
            Some(existing) if *existing == address => return Ok(row.account.clone()),
            Some(existing) => {
                return Err(WalletError::AddressAlreadyBound {
                    user,
                    address: existing.clone(),
                })
            }
            None => {}
        }

        match self.addresses.entry(address.clone()) {
            Entry::Occupied(_) => return Err(WalletError::AddressInUse { address }),
            Entry::Vacant(slot) => {
                self.persist(JournalRecord::AddressBound {
                    user_id: user,
                    address: address.clone(),
                    from_ledger: Some(from_ledger),
                })?;
                slot.insert(user);
            }
        }

        info!(user = %user, address = %address, from_ledger, "External address bound");
        row.account.external_address = Some(address);
        row.account.address_ledger = Some(from_ledger);
        Ok(row.account.clone())
    }

    fn deactivate_account(&self, user: UserId) -> Result<Account, WalletError> {
        let row = self.row(user)?;
        let mut row = row.lock();

        if row.account.active {
            if row.account.spendable > 0 || row.account.staked > 0 {
                return Err(WalletError::AccountNotEmpty {
                    user,
                    spendable: row.account.spendable,
                    staked: row.account.staked,
                });
            }
            self.persist(JournalRecord::AccountDeactivated { user_id: user })?;
            row.account.active = false;
            info!(user = %user, "Account deactivated");
        }
        Ok(row.account.clone())
    }

    fn find_by_address(&self, address: &ExternalAddress) -> Option<UserId> {
        self.addresses.get(address).map(|owner| *owner.value())
    }

    fn entries(&self, user: UserId) -> Result<Vec<LedgerEntry>, WalletError> {
        Ok(self.row(user)?.lock().entries.clone())
    }

    fn create_order(&self, order: Order) -> Result<Order, WalletError> {
        if order.status != OrderStatus::Pending {
            return Err(WalletError::InvalidOrderTransition {
                order_id: order.id,
                from: order.status,
                to: OrderStatus::Pending,
            });
        }
        if !self.row(order.user_id)?.lock().account.active {
            return Err(WalletError::AccountInactive {
                user: order.user_id,
            });
        }

        self.persist(JournalRecord::OrderCreated {
            order: order.clone(),
        })?;
        self.orders.insert(order.id, order.clone());
        Ok(order)
    }

    fn get_order(&self, order_id: OrderId) -> Result<Order, WalletError> {
        self.orders
            .get(&order_id)
            .map(|order| order.value().clone())
            .ok_or_else(|| WalletError::not_found("Order", order_id))
    }

    fn fail_order(&self, order_id: OrderId) -> Result<Order, WalletError> {
        let mut order = self
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| WalletError::not_found("Order", order_id))?;

        let mut failed = order.value().clone();
        failed.finalize(OrderStatus::Failed)?;

        self.persist(JournalRecord::OrderFailed { order_id })?;
        *order = failed;
        Ok(order.value().clone())
    }

    fn accounts(&self) -> Vec<Account> {
        let mut accounts: Vec<Account> = self
            .accounts
            .iter()
            .map(|row| row.value().lock().account.clone())
            .collect();
        accounts.sort_by_key(|account| account.user_id);
        accounts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LineItem, Pool, TokenAmount};
    use rstest::rstest;
    use std::thread;
    use tempfile::tempdir;

    fn funded(spendable: TokenAmount) -> AccountLedger {
        let ledger = AccountLedger::new();
        ledger.open_account(UserId(1)).unwrap();
        if spendable > 0 {
            ledger
                .apply_mutation(UserId(1), Mutation::new(EntryKind::TopupCredit, spendable))
                .unwrap();
        }
        ledger
    }

    fn pending_order(user: UserId, total: TokenAmount) -> Order {
        Order::pending(
            user,
            vec![LineItem {
                item_id: "crate-of-apples".to_string(),
                quantity: 1,
                unit_price: total,
            }],
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_open_account_is_idempotent() {
        let ledger = funded(50);

        let again = ledger.open_account(UserId(1)).unwrap();

        assert_eq!(again.spendable, 50);
        assert_eq!(ledger.accounts().len(), 1);
    }

    #[test]
    fn test_get_account_unknown_user_is_not_found() {
        let ledger = AccountLedger::new();

        let result = ledger.get_account(UserId(42));

        assert_eq!(result.unwrap_err(), WalletError::account_not_found(UserId(42)));
    }

    #[test]
    fn test_mutation_on_unknown_account_is_not_found() {
        let ledger = AccountLedger::new();

        let result = ledger.apply_mutation(UserId(5), Mutation::new(EntryKind::TopupCredit, 1));

        assert!(matches!(result.unwrap_err(), WalletError::NotFound { .. }));
    }

    #[test]
    fn test_zero_amount_is_rejected() {
        let ledger = funded(10);

        let result = ledger.apply_mutation(UserId(1), Mutation::new(EntryKind::Stake, 0));

        assert!(matches!(result.unwrap_err(), WalletError::InvalidAmount { .. }));
        assert!(ledger.entries(UserId(1)).unwrap().len() == 1);
    }

    #[rstest]
    #[case::stake(EntryKind::Stake, Pool::Spendable)]
    #[case::order_debit(EntryKind::OrderDebit, Pool::Spendable)]
    #[case::withdraw_debit(EntryKind::WithdrawDebit, Pool::Spendable)]
    #[case::unstake(EntryKind::Unstake, Pool::Staked)]
    fn test_overdraft_leaves_no_trace(#[case] kind: EntryKind, #[case] pool: Pool) {
        let ledger = funded(20);

        let result = ledger.apply_mutation(UserId(1), Mutation::new(kind, 30));

        let available = if pool == Pool::Spendable { 20 } else { 0 };
        assert_eq!(
            result.unwrap_err(),
            WalletError::insufficient_balance(UserId(1), pool, available, 30)
        );
        let account = ledger.get_account(UserId(1)).unwrap();
        assert_eq!((account.spendable, account.staked), (20, 0));
        assert_eq!(ledger.entries(UserId(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_external_ref_credits_once() {
        let ledger = funded(0);
        let credit = Mutation::new(EntryKind::ExternalCredit, 25)
            .with_external_ref(TxHash::new("E3B0C442"));

        ledger.apply_mutation(UserId(1), credit.clone()).unwrap();
        let second = ledger.apply_mutation(UserId(1), credit);

        assert_eq!(
            second.unwrap_err(),
            WalletError::duplicate_settlement(TxHash::new("E3B0C442"))
        );
        assert_eq!(ledger.get_account(UserId(1)).unwrap().spendable, 25);
        assert_eq!(ledger.entries(UserId(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_credit_does_not_consume_reference() {
        let ledger = funded(0);
        ledger.deactivate_account(UserId(1)).unwrap();
        let credit = Mutation::new(EntryKind::ExternalCredit, 5)
            .with_external_ref(TxHash::new("AA"));

        assert!(ledger.apply_mutation(UserId(1), credit.clone()).is_err());
        assert!(ledger.settled_refs.is_empty());
    }

    #[test]
    fn test_balances_equal_prefix_sum_of_entries() {
        let ledger = funded(100);
        let steps = [
            (EntryKind::Stake, 40),
            (EntryKind::OrderDebit, 30),
            (EntryKind::ExternalCredit, 12),
            (EntryKind::Unstake, 15),
            (EntryKind::WithdrawDebit, 7),
            (EntryKind::Stake, 3),
        ];
        for (kind, amount) in steps {
            ledger.apply_mutation(UserId(1), Mutation::new(kind, amount)).unwrap();
        }

        let (mut spendable, mut staked) = (0i128, 0i128);
        for entry in ledger.entries(UserId(1)).unwrap() {
            let (ds, dk) = entry.kind.deltas(entry.amount);
            spendable += ds;
            staked += dk;
        }

        let account = ledger.get_account(UserId(1)).unwrap();
        assert_eq!(i128::from(account.spendable), spendable);
        assert_eq!(i128::from(account.staked), staked);
    }

    #[test]
    fn test_entries_are_in_commit_order() {
        let ledger = funded(10);
        ledger.apply_mutation(UserId(1), Mutation::new(EntryKind::Stake, 4)).unwrap();
        ledger.apply_mutation(UserId(1), Mutation::new(EntryKind::Unstake, 2)).unwrap();

        let ids: Vec<u64> = ledger
            .entries(UserId(1))
            .unwrap()
            .iter()
            .map(|entry| entry.id.0)
            .collect();

        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_order_debit_finalizes_order_in_same_unit() {
        let ledger = funded(100);
        let order = ledger.create_order(pending_order(UserId(1), 60)).unwrap();

        let entry = ledger
            .apply_mutation(
                UserId(1),
                Mutation::new(EntryKind::OrderDebit, 60).for_order(order.id),
            )
            .unwrap();

        assert_eq!(entry.order_id, Some(order.id));
        assert_eq!(ledger.get_order(order.id).unwrap().status, OrderStatus::Paid);
        assert_eq!(ledger.get_account(UserId(1)).unwrap().spendable, 40);
    }

    #[test]
    fn test_order_debit_must_match_order_total() {
        let ledger = funded(100);
        let order = ledger.create_order(pending_order(UserId(1), 60)).unwrap();

        let result = ledger.apply_mutation(
            UserId(1),
            Mutation::new(EntryKind::OrderDebit, 59).for_order(order.id),
        );

        assert!(matches!(result.unwrap_err(), WalletError::InvalidAmount { .. }));
        assert_eq!(ledger.get_order(order.id).unwrap().status, OrderStatus::Pending);
        assert_eq!(ledger.get_account(UserId(1)).unwrap().spendable, 100);
    }

    #[test]
    fn test_paid_order_cannot_be_paid_or_failed_again() {
        let ledger = funded(100);
        let order = ledger.create_order(pending_order(UserId(1), 10)).unwrap();
        let debit = Mutation::new(EntryKind::OrderDebit, 10).for_order(order.id);
        ledger.apply_mutation(UserId(1), debit.clone()).unwrap();

        assert!(matches!(
            ledger.apply_mutation(UserId(1), debit).unwrap_err(),
            WalletError::InvalidOrderTransition { .. }
        ));
        assert!(ledger.fail_order(order.id).is_err());
        assert_eq!(ledger.get_account(UserId(1)).unwrap().spendable, 90);
    }

    #[test]
    fn test_bind_external_address_is_set_once() {
        let ledger = funded(0);
        ledger.open_account(UserId(2)).unwrap();
        let address = ExternalAddress::parse("rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh").unwrap();
        let other = ExternalAddress::parse("rDsbeomae4FXwgQTJp9Rs64Qg9vDiTCdBv").unwrap();

        let bound = ledger.bind_external_address(UserId(1), address.clone(), 700).unwrap();
        assert_eq!(bound.address_ledger, Some(700));

        // Rebinding the same address is a no-op and keeps the first start ledger
        let rebound = ledger.bind_external_address(UserId(1), address.clone(), 900).unwrap();
        assert_eq!(rebound.address_ledger, Some(700));
        assert!(matches!(
            ledger.bind_external_address(UserId(1), other, 900).unwrap_err(),
            WalletError::AddressAlreadyBound { .. }
        ));
        assert!(matches!(
            ledger.bind_external_address(UserId(2), address.clone(), 900).unwrap_err(),
            WalletError::AddressInUse { .. }
        ));
        assert_eq!(ledger.find_by_address(&address), Some(UserId(1)));
    }

    #[test]
    fn test_inactive_account_rejects_mutations() {
        let ledger = funded(0);
        ledger.deactivate_account(UserId(1)).unwrap();

        let result = ledger.apply_mutation(UserId(1), Mutation::new(EntryKind::TopupCredit, 1));

        assert_eq!(result.unwrap_err(), WalletError::AccountInactive { user: UserId(1) });
        // Idempotent once inactive
        assert!(!ledger.deactivate_account(UserId(1)).unwrap().active);
    }

    #[rstest]
    #[case::spendable(0, 10, 0)]
    #[case::staked(10, 0, 10)]
    fn test_deactivation_requires_empty_pools(
        #[case] stake: TokenAmount,
        #[case] spendable: TokenAmount,
        #[case] staked: TokenAmount,
    ) {
        let ledger = funded(10);
        if stake > 0 {
            ledger.apply_mutation(UserId(1), Mutation::new(EntryKind::Stake, stake)).unwrap();
        }

        let error = ledger.deactivate_account(UserId(1)).unwrap_err();

        assert_eq!(
            error,
            WalletError::AccountNotEmpty {
                user: UserId(1),
                spendable,
                staked,
            }
        );
        assert!(ledger.get_account(UserId(1)).unwrap().active);
    }

    #[test]
    fn test_entry_records_balances_after_commit() {
        let ledger = funded(100);

        let entry = ledger
            .apply_mutation(UserId(1), Mutation::new(EntryKind::Stake, 30))
            .unwrap();

        assert_eq!((entry.spendable_after, entry.staked_after), (70, 30));
    }

    #[test]
    fn test_replay_rejects_entry_with_wrong_balances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        {
            let ledger = AccountLedger::open(&path, false).unwrap();
            ledger.open_account(UserId(1)).unwrap();
            ledger
                .apply_mutation(UserId(1), Mutation::new(EntryKind::TopupCredit, 10))
                .unwrap();
        }
        let tampered = std::fs::read_to_string(&path)
            .unwrap()
            .replace("\"spendable_after\":10", "\"spendable_after\":11");
        std::fs::write(&path, tampered).unwrap();

        let result = AccountLedger::open(&path, false);

        assert!(matches!(result.unwrap_err(), WalletError::StorageUnavailable { .. }));
    }

    // Concurrent access tests
    #[test]
    fn test_concurrent_stakes_never_overdraw() {
        let ledger = Arc::new(funded(100));
        let mut handles = vec![];

        for _ in 0..2 {
            let ledger = Arc::clone(&ledger);
            handles.push(thread::spawn(move || {
                ledger.apply_mutation(UserId(1), Mutation::new(EntryKind::Stake, 60))
            }));
        }

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        let insufficient = results
            .iter()
            .filter(|r| matches!(r, Err(WalletError::InsufficientBalance { .. })))
            .count();

        assert_eq!(succeeded, 1);
        assert_eq!(insufficient, 1);
        let account = ledger.get_account(UserId(1)).unwrap();
        assert_eq!((account.spendable, account.staked), (40, 60));
    }

    #[test]
    fn test_concurrent_mutations_across_accounts() {
        let ledger = Arc::new(AccountLedger::new());
        let mut handles = vec![];

        for user in 0..8u64 {
            let ledger = Arc::clone(&ledger);
            handles.push(thread::spawn(move || {
                ledger.open_account(UserId(user)).unwrap();
                for _ in 0..100 {
                    ledger
                        .apply_mutation(UserId(user), Mutation::new(EntryKind::TopupCredit, 2))
                        .unwrap();
                    ledger
                        .apply_mutation(UserId(user), Mutation::new(EntryKind::Stake, 1))
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        for account in ledger.accounts() {
            assert_eq!((account.spendable, account.staked), (100, 100));
        }
    }

    #[test]
    fn test_concurrent_duplicate_credit_applies_once() {
        let ledger = Arc::new(funded(0));
        let mut handles = vec![];

        for _ in 0..8 {
            let ledger = Arc::clone(&ledger);
            handles.push(thread::spawn(move || {
                ledger.apply_mutation(
                    UserId(1),
                    Mutation::new(EntryKind::ExternalCredit, 10)
                        .with_external_ref(TxHash::new("SAME")),
                )
            }));
        }

        let ok = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| r.is_ok())
            .count();

        assert_eq!(ok, 1);
        assert_eq!(ledger.get_account(UserId(1)).unwrap().spendable, 10);
    }

    #[test]
    fn test_journal_replay_restores_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let address = ExternalAddress::parse("rPT1Sjq2YGrBMTttX4GZHjKu9dyfzbpAYe").unwrap();

        let (paid, failed) = {
            let ledger = AccountLedger::open(&path, false).unwrap();
            ledger.open_account(UserId(1)).unwrap();
            ledger.bind_external_address(UserId(1), address.clone(), 1_234).unwrap();
            ledger
                .apply_mutation(
                    UserId(1),
                    Mutation::new(EntryKind::ExternalCredit, 100)
                        .with_external_ref(TxHash::new("IN-1")),
                )
                .unwrap();
            ledger.apply_mutation(UserId(1), Mutation::new(EntryKind::Stake, 40)).unwrap();

            let paid = ledger.create_order(pending_order(UserId(1), 50)).unwrap();
            ledger
                .apply_mutation(
                    UserId(1),
                    Mutation::new(EntryKind::OrderDebit, 50).for_order(paid.id),
                )
                .unwrap();
            let failed = ledger.create_order(pending_order(UserId(1), 500)).unwrap();
            ledger.fail_order(failed.id).unwrap();
            (paid.id, failed.id)
        };

        let restored = AccountLedger::open(&path, false).unwrap();

        let account = restored.get_account(UserId(1)).unwrap();
        assert_eq!((account.spendable, account.staked), (10, 40));
        assert_eq!(account.external_address, Some(address.clone()));
        assert_eq!(account.address_ledger, Some(1_234));
        assert_eq!(restored.find_by_address(&address), Some(UserId(1)));
        assert_eq!(restored.get_order(paid).unwrap().status, OrderStatus::Paid);
        assert_eq!(restored.get_order(failed).unwrap().status, OrderStatus::Failed);
        assert_eq!(restored.entries(UserId(1)).unwrap().len(), 3);

        // The idempotency guard survives a restart
        let again = restored.apply_mutation(
            UserId(1),
            Mutation::new(EntryKind::ExternalCredit, 100).with_external_ref(TxHash::new("IN-1")),
        );
        assert!(matches!(again.unwrap_err(), WalletError::DuplicateSettlement { .. }));

        // New entries continue the id sequence
        let next = restored
            .apply_mutation(UserId(1), Mutation::new(EntryKind::TopupCredit, 1))
            .unwrap();
        assert_eq!(next.id, EntryId(4));
    }

    #[test]
    fn test_snapshot_reads_without_taking_over_journal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");

        let live = AccountLedger::open(&path, false).unwrap();
        live.open_account(UserId(1)).unwrap();
        live.apply_mutation(UserId(1), Mutation::new(EntryKind::TopupCredit, 25))
            .unwrap();

        let snapshot = AccountLedger::snapshot(&path).unwrap();
        assert_eq!(snapshot.get_account(UserId(1)).unwrap().spendable, 25);

        // Writes to the snapshot stay in memory
        snapshot.open_account(UserId(2)).unwrap();
        let reopened = AccountLedger::snapshot(&path).unwrap();
        assert!(reopened.get_account(UserId(2)).is_err());
    }
}
