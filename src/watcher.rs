//! Reconciliation watcher
//!
//! Listens to the gateway's inbound payment stream for every bound external
//! address and credits confirmed payments to the owning account through the
//! engine. The ledger's settlement reference guard makes crediting
//! idempotent, so redelivered events (after a reconnect backfill, say) are
//! dropped as duplicates and never credited twice.
//!
//! An event that still cannot be credited after its immediate retries is
//! parked and retried by its address's task every `PARKED_RETRY_INTERVAL`
//! until it is credited or recognized as a duplicate.
//!
//! # States
//!
//! ```text
//! Idle --watch--> Subscribed --event--> Crediting --done--> Subscribed
//!                      \--stream closed / shutdown--> Idle
//! ```

use crate::core::WalletEngine;
use crate::types::{EntryId, ExternalAddress, ExternalPaymentEvent, TxHash, WalletError};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Attempts at crediting one event before parking it
const CREDIT_ATTEMPTS: u32 = 5;
const CREDIT_BACKOFF_BASE: Duration = Duration::from_millis(200);
const CREDIT_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// How often each watch retries its parked events
pub const PARKED_RETRY_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchState {
    Idle,
    Subscribed,
    Crediting,
}

/// What became of one inbound payment event
#[derive(Debug, Clone, PartialEq)]
pub enum CreditOutcome {
    Credited(EntryId),
    /// Already credited earlier
    Duplicate,
    /// Not confirmed, or the destination belongs to no account
    Skipped,
    Failed(WalletError),
}

/// A confirmed payment that is owed to an account but not yet credited
#[derive(Debug, Clone, PartialEq)]
pub struct ParkedCredit {
    pub event: ExternalPaymentEvent,
    pub last_error: WalletError,
    /// Credit attempts so far, including the immediate retries
    pub attempts: u32,
}

type Parked = Arc<DashMap<TxHash, ParkedCredit>>;

pub struct ReconciliationWatcher {
    engine: WalletEngine,
    states: Arc<DashMap<ExternalAddress, WatchState>>,
    parked: Parked,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl ReconciliationWatcher {
    pub fn new(engine: WalletEngine) -> Self {
        Self {
            engine,
            states: Arc::new(DashMap::new()),
            parked: Arc::new(DashMap::new()),
            tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start watching `address` for payments validated from `from_ledger` on
    ///
    /// Returns `false` if it is already watched or the watcher was shut down.
    pub fn watch(&self, address: ExternalAddress, from_ledger: Option<u64>) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        {
            let mut state = self.states.entry(address.clone()).or_insert(WatchState::Idle);
            if *state != WatchState::Idle {
                return false;
            }
            *state = WatchState::Subscribed;
        }

        let events = self.engine.gateway().subscribe(address.clone(), from_ledger);
        let watch = Watch {
            engine: self.engine.clone(),
            states: Arc::clone(&self.states),
            parked: Arc::clone(&self.parked),
            address: address.clone(),
        };
        let shutdown = self.shutdown.child_token();
        info!(address = %address, from_ledger = ?from_ledger, "Watching external address");

        let handle = tokio::spawn(watch.run(events, shutdown));
        self.tasks.lock().push(handle);
        true
    }

    /// Watch every active account with a bound address
    ///
    /// Returns how many new watches were started.
    pub fn watch_all(&self) -> usize {
        let started = self
            .engine
            .store()
            .accounts()
            .into_iter()
            .filter(|account| account.active)
            .filter(|account| match &account.external_address {
                Some(address) => self.watch(address.clone(), account.address_ledger),
                None => false,
            })
            .count();
        info!(watches = started, "Reconciliation watches started");
        started
    }

    pub fn state(&self, address: &ExternalAddress) -> WatchState {
        self.states
            .get(address)
            .map(|state| *state)
            .unwrap_or(WatchState::Idle)
    }

    /// Payments that are owed but could not be credited yet
    pub fn parked_credits(&self) -> Vec<ParkedCredit> {
        self.parked.iter().map(|parked| parked.value().clone()).collect()
    }

    /// Retry every parked event once, whatever its address
    ///
    /// Returns how many were resolved (credited, or found already credited).
    pub fn retry_parked(&self) -> usize {
        retry_parked(&self.engine, &self.parked, None)
    }

    /// Stop every watch and wait for the tasks to finish
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Watch task ended abnormally");
            }
        }
        info!("Reconciliation watcher stopped");
    }
}

/// State shared by the task of one watched address
struct Watch {
    engine: WalletEngine,
    states: Arc<DashMap<ExternalAddress, WatchState>>,
    parked: Parked,
    address: ExternalAddress,
}

impl Watch {
    async fn run(self, mut events: mpsc::Receiver<ExternalPaymentEvent>, shutdown: CancellationToken) {
        let mut retry = interval_at(Instant::now() + PARKED_RETRY_INTERVAL, PARKED_RETRY_INTERVAL);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = retry.tick() => {
                    retry_parked(&self.engine, &self.parked, Some(&self.address));
                    continue;
                }
                event = events.recv() => match event {
                    Some(event) => event,
                    None => {
                        warn!(address = %self.address, "Payment stream closed");
                        break;
                    }
                },
            };

            self.states.insert(self.address.clone(), WatchState::Crediting);
            if let CreditOutcome::Failed(e) = credit_with_retry(&self.engine, &event).await {
                error!(
                    hash = %event.tx_hash,
                    destination = %event.destination,
                    amount = event.amount,
                    error = %e,
                    "Inbound payment could not be credited, parking it"
                );
                self.parked.insert(
                    event.tx_hash.clone(),
                    ParkedCredit {
                        event,
                        last_error: e,
                        attempts: CREDIT_ATTEMPTS,
                    },
                );
            }
            self.states.insert(self.address.clone(), WatchState::Subscribed);
        }

        self.states.insert(self.address, WatchState::Idle);
    }
}

/// Credit one event, retrying storage failures with exponential backoff
async fn credit_with_retry(engine: &WalletEngine, event: &ExternalPaymentEvent) -> CreditOutcome {
    let mut attempt = 0;
    loop {
        let outcome = handle_event(engine, event);
        match &outcome {
            CreditOutcome::Failed(e) if e.is_retryable() && attempt + 1 < CREDIT_ATTEMPTS => {
                let delay = CREDIT_BACKOFF_BASE
                    .saturating_mul(2u32.saturating_pow(attempt))
                    .min(CREDIT_BACKOFF_MAX);
                warn!(hash = %event.tx_hash, error = %e, attempt, delay = ?delay, "Credit failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            _ => return outcome,
        }
    }
}

/// One pass over the parked events, optionally only those for `address`
fn retry_parked(engine: &WalletEngine, parked: &Parked, address: Option<&ExternalAddress>) -> usize {
    let due: Vec<ExternalPaymentEvent> = parked
        .iter()
        .filter(|entry| address.map_or(true, |address| entry.event.destination == *address))
        .map(|entry| entry.event.clone())
        .collect();

    let mut resolved = 0;
    for event in due {
        match handle_event(engine, &event) {
            CreditOutcome::Failed(e) => {
                warn!(hash = %event.tx_hash, error = %e, "Parked payment still not credited");
                if let Some(mut entry) = parked.get_mut(&event.tx_hash) {
                    entry.attempts += 1;
                    entry.last_error = e;
                }
            }
            outcome => {
                info!(hash = %event.tx_hash, outcome = ?outcome, "Parked payment resolved");
                parked.remove(&event.tx_hash);
                resolved += 1;
            }
        }
    }
    resolved
}

/// Credit a single event to the owner of its destination address
pub fn handle_event(engine: &WalletEngine, event: &ExternalPaymentEvent) -> CreditOutcome {
    if !event.is_confirmed() {
        debug!(hash = %event.tx_hash, "Skipping unconfirmed payment");
        return CreditOutcome::Skipped;
    }

    let Some(user) = engine.store().find_by_address(&event.destination) else {
        warn!(hash = %event.tx_hash, destination = %event.destination, "No account for payment destination");
        return CreditOutcome::Skipped;
    };

    match engine.credit_external(user, event.amount, event.tx_hash.clone()) {
        Ok(entry) => CreditOutcome::Credited(entry.id),
        Err(WalletError::DuplicateSettlement { .. }) => {
            debug!(hash = %event.tx_hash, user = %user, "Payment already credited");
            CreditOutcome::Duplicate
        }
        Err(e) => CreditOutcome::Failed(e),
    }
}
