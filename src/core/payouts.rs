//! Outbound payout tracking for withdrawals
//!
//! A withdrawal debits the ledger first and only then pays out. Every
//! `withdraw_debit` entry gets a `PayoutTask` here, keyed by the entry id, that
//! follows the payout to completion. A failed or unconfirmed send never
//! reverses the debit; the task is retried instead, and handed to an operator
//! once its attempts are used up.
//!
//! # Status transitions
//!
//! ```text
//! Sending --ok--------------------------> Completed
//!         --rejected--------------------> Failed   --retry--> Sending
//!         --submitted, unconfirmed------> Unknown  --recheck--> Completed | Sending | Unknown
//! Failed (attempts exhausted) ----------> NeedsOperator
//! bank withdrawal ----------------------> Manual
//! ```
//!
//! Tasks are held in memory only; a restart loses unfinished tasks while the
//! debit entries stay in the journal.
// TODO: journal payout task transitions so unfinished payouts survive a restart

use crate::settlement::SettlementGateway;
use crate::types::{EntryId, ExternalAddress, PaymentStatus, TokenAmount, TxHash, UserId, WalletError};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

/// How a withdrawal leaves the wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum WithdrawalMethod {
    /// On-chain payment, to `destination` or else the account's bound address
    Xrpl { destination: Option<ExternalAddress> },
    /// Paid out manually by an operator
    Bank,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PayoutStatus {
    /// A send is in flight
    Sending,
    Completed { tx_hash: TxHash },
    /// Rejected without reaching the network; safe to send again
    Failed { reason: String },
    /// Submitted but unconfirmed; must be re-checked before sending again
    Unknown { tx_hash: Option<TxHash> },
    /// Bank payout awaiting an operator
    Manual,
    /// Attempts exhausted
    NeedsOperator { reason: String },
}

impl PayoutStatus {
    /// No further automatic action will be taken on the task
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            PayoutStatus::Completed { .. } | PayoutStatus::Manual | PayoutStatus::NeedsOperator { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutTask {
    pub entry_id: EntryId,
    pub user_id: UserId,
    pub amount: TokenAmount,
    /// `None` for manual payouts
    pub destination: Option<ExternalAddress>,
    pub status: PayoutStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    last_attempt: Instant,
}

/// What a claimed task should do next
enum Claim {
    Send {
        amount: TokenAmount,
        destination: ExternalAddress,
    },
    Recheck(TxHash),
}

#[derive(Debug)]
pub struct PayoutQueue {
    tasks: DashMap<EntryId, PayoutTask>,
    max_attempts: u32,
    /// Minimum age of an `Unknown` task before it is re-checked
    recheck_after: Duration,
}

impl PayoutQueue {
    pub fn new(max_attempts: u32, recheck_after: Duration) -> Self {
        Self {
            tasks: DashMap::new(),
            max_attempts: max_attempts.max(1),
            recheck_after,
        }
    }

    /// Register an on-chain payout for a committed withdrawal debit
    pub fn enqueue(
        &self,
        entry_id: EntryId,
        user_id: UserId,
        amount: TokenAmount,
        destination: ExternalAddress,
    ) -> PayoutTask {
        self.insert(entry_id, user_id, amount, Some(destination), PayoutStatus::Sending)
    }

    /// Register a bank payout; nothing is sent automatically
    pub fn enqueue_manual(&self, entry_id: EntryId, user_id: UserId, amount: TokenAmount) -> PayoutTask {
        info!(entry = %entry_id, user = %user_id, amount, "Bank payout queued for manual processing");
        self.insert(entry_id, user_id, amount, None, PayoutStatus::Manual)
    }

    fn insert(
        &self,
        entry_id: EntryId,
        user_id: UserId,
        amount: TokenAmount,
        destination: Option<ExternalAddress>,
        status: PayoutStatus,
    ) -> PayoutTask {
        let task = PayoutTask {
            entry_id,
            user_id,
            amount,
            destination,
            status,
            attempts: 0,
            last_error: None,
            last_attempt: Instant::now(),
        };
        self.tasks.insert(entry_id, task.clone());
        task
    }

    pub fn get(&self, entry_id: EntryId) -> Option<PayoutTask> {
        self.tasks.get(&entry_id).map(|task| task.value().clone())
    }

    /// Snapshot of all tasks, ordered by entry id
    pub fn tasks(&self) -> Vec<PayoutTask> {
        let mut tasks: Vec<PayoutTask> = self.tasks.iter().map(|task| task.value().clone()).collect();
        tasks.sort_by_key(|task| task.entry_id);
        tasks
    }

    /// Perform the first send of a freshly enqueued task
    ///
    /// Returns the resulting status, or `None` when the task is unknown or
    /// was already picked up.
    pub async fn send(&self, gateway: &dyn SettlementGateway, entry_id: EntryId) -> Option<PayoutStatus> {
        let claim = self.claim(entry_id, |task| task.status == PayoutStatus::Sending && task.attempts == 0)?;
        Some(self.execute(gateway, entry_id, claim).await)
    }

    /// Retry failed sends and re-check unconfirmed ones
    ///
    /// Returns how many tasks were acted on.
    pub async fn retry_pending(&self, gateway: &dyn SettlementGateway) -> usize {
        let now = Instant::now();
        let due: Vec<EntryId> = self
            .tasks
            .iter()
            .filter(|task| match &task.status {
                PayoutStatus::Failed { .. } => true,
                PayoutStatus::Unknown { .. } => now.duration_since(task.last_attempt) >= self.recheck_after,
                _ => false,
            })
            .map(|task| task.entry_id)
            .collect();

        let mut acted = 0;
        for entry_id in due {
            let Some(claim) = self.claim(entry_id, |task| {
                matches!(task.status, PayoutStatus::Failed { .. } | PayoutStatus::Unknown { .. })
            }) else {
                continue;
            };
            self.execute(gateway, entry_id, claim).await;
            acted += 1;
        }
        acted
    }

    /// Periodically run `retry_pending` until `shutdown` is cancelled
    pub async fn run(
        self: Arc<Self>,
        gateway: Arc<dyn SettlementGateway>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?interval, "Payout retry loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let acted = self.retry_pending(gateway.as_ref()).await;
                    if acted > 0 {
                        info!(tasks = acted, "Payout retry pass finished");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
        info!("Payout retry loop stopped");
    }

    /// Atomically move an eligible task to `Sending`
    fn claim(&self, entry_id: EntryId, eligible: impl Fn(&PayoutTask) -> bool) -> Option<Claim> {
        let mut task = self.tasks.get_mut(&entry_id)?;
        if !eligible(&task) {
            return None;
        }
        let destination = task.destination.clone()?;

        let claim = match &task.status {
            PayoutStatus::Unknown { tx_hash: Some(tx_hash) } => Claim::Recheck(tx_hash.clone()),
            _ => Claim::Send {
                amount: task.amount,
                destination,
            },
        };
        task.status = PayoutStatus::Sending;
        task.last_attempt = Instant::now();
        Some(claim)
    }

    async fn execute(&self, gateway: &dyn SettlementGateway, entry_id: EntryId, claim: Claim) -> PayoutStatus {
        let (amount, destination) = match claim {
            Claim::Send { amount, destination } => (amount, destination),
            Claim::Recheck(tx_hash) => match gateway.payment_status(&tx_hash).await {
                Ok(PaymentStatus::Validated) => {
                    info!(entry = %entry_id, hash = %tx_hash, "Payout confirmed on re-check");
                    return self.settle(entry_id, PayoutStatus::Completed { tx_hash }, None);
                }
                Ok(PaymentStatus::Pending) => {
                    return self.settle(entry_id, PayoutStatus::Unknown { tx_hash: Some(tx_hash) }, None);
                }
                Err(e) => {
                    warn!(entry = %entry_id, hash = %tx_hash, error = %e, "Payout re-check failed");
                    return self.settle(
                        entry_id,
                        PayoutStatus::Unknown { tx_hash: Some(tx_hash) },
                        Some(e.to_string()),
                    );
                }
                Ok(PaymentStatus::Failed(_)) | Ok(PaymentStatus::NotFound) => {
                    match self.get(entry_id).and_then(|task| Some((task.amount, task.destination?))) {
                        Some(send) => send,
                        None => return PayoutStatus::Sending,
                    }
                }
            },
        };

        if let Some(mut task) = self.tasks.get_mut(&entry_id) {
            task.attempts += 1;
        }

        match gateway.send_payment(amount, &destination).await {
            Ok(receipt) => {
                info!(entry = %entry_id, hash = %receipt.tx_hash, amount, "Payout completed");
                self.settle(entry_id, PayoutStatus::Completed { tx_hash: receipt.tx_hash }, None)
            }
            Err(WalletError::SettlementFailed {
                reason,
                tx_hash: Some(tx_hash),
            }) => {
                warn!(entry = %entry_id, hash = %tx_hash, reason = %reason, "Payout outcome unknown");
                self.settle(entry_id, PayoutStatus::Unknown { tx_hash: Some(tx_hash) }, Some(reason))
            }
            Err(e) => {
                let reason = e.to_string();
                error!(entry = %entry_id, error = %reason, "Payout failed");
                self.settle(entry_id, PayoutStatus::Failed { reason: reason.clone() }, Some(reason))
            }
        }
    }

    /// Record the outcome of an attempt, escalating exhausted failures
    fn settle(&self, entry_id: EntryId, status: PayoutStatus, last_error: Option<String>) -> PayoutStatus {
        let Some(mut task) = self.tasks.get_mut(&entry_id) else {
            return status;
        };

        task.status = match status {
            PayoutStatus::Failed { reason } if task.attempts >= self.max_attempts => {
                error!(
                    entry = %entry_id,
                    user = %task.user_id,
                    attempts = task.attempts,
                    "Payout attempts exhausted; operator action required"
                );
                PayoutStatus::NeedsOperator { reason }
            }
            status => status,
        };
        if last_error.is_some() {
            task.last_error = last_error;
        }
        task.last_attempt = Instant::now();
        task.status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::{SendOutcome, SimulatedGateway};

    fn destination() -> ExternalAddress {
        ExternalAddress::parse("rPayee").unwrap()
    }

    fn queue() -> PayoutQueue {
        PayoutQueue::new(3, Duration::ZERO)
    }

    #[rstest::rstest]
    #[case::sending(PayoutStatus::Sending, false)]
    #[case::failed(PayoutStatus::Failed { reason: "x".into() }, false)]
    #[case::unknown(PayoutStatus::Unknown { tx_hash: None }, false)]
    #[case::completed(PayoutStatus::Completed { tx_hash: TxHash::new("A") }, true)]
    #[case::manual(PayoutStatus::Manual, true)]
    #[case::operator(PayoutStatus::NeedsOperator { reason: "x".into() }, true)]
    fn test_is_final(#[case] status: PayoutStatus, #[case] expected: bool) {
        assert_eq!(status.is_final(), expected);
    }

    #[tokio::test]
    async fn test_successful_send_completes_task() {
        let gateway = SimulatedGateway::new("https://pay.example");
        let queue = queue();
        queue.enqueue(EntryId(1), UserId(1), 40, destination());

        let status = queue.send(&gateway, EntryId(1)).await.unwrap();

        assert!(matches!(status, PayoutStatus::Completed { .. }));
        assert_eq!(queue.get(EntryId(1)).unwrap().attempts, 1);
        assert_eq!(gateway.sent_payments().len(), 1);
    }

    #[tokio::test]
    async fn test_send_is_only_claimed_once() {
        let gateway = SimulatedGateway::new("https://pay.example");
        let queue = queue();
        queue.enqueue(EntryId(1), UserId(1), 40, destination());

        queue.send(&gateway, EntryId(1)).await.unwrap();

        assert_eq!(queue.send(&gateway, EntryId(1)).await, None);
        assert_eq!(gateway.sent_payments().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_send_is_retried() {
        let gateway = SimulatedGateway::new("https://pay.example");
        gateway.script_send(SendOutcome::Reject("tecNO_DST_INSUF_XRP".to_string()));
        let queue = queue();
        queue.enqueue(EntryId(1), UserId(1), 40, destination());

        let status = queue.send(&gateway, EntryId(1)).await.unwrap();
        assert!(matches!(status, PayoutStatus::Failed { .. }));

        assert_eq!(queue.retry_pending(&gateway).await, 1);

        let task = queue.get(EntryId(1)).unwrap();
        assert!(matches!(task.status, PayoutStatus::Completed { .. }));
        assert_eq!(task.attempts, 2);
        assert!(task.last_error.is_some());
    }

    #[tokio::test]
    async fn test_unknown_outcome_rechecks_before_resending() {
        let gateway = SimulatedGateway::new("https://pay.example");
        gateway.script_send(SendOutcome::TimeOut {
            status: PaymentStatus::Pending,
        });
        let queue = queue();
        queue.enqueue(EntryId(1), UserId(1), 40, destination());

        let PayoutStatus::Unknown { tx_hash: Some(hash) } = queue.send(&gateway, EntryId(1)).await.unwrap() else {
            panic!("expected unknown outcome with hash");
        };

        // Still pending: left alone, nothing re-sent
        queue.retry_pending(&gateway).await;
        assert!(matches!(queue.get(EntryId(1)).unwrap().status, PayoutStatus::Unknown { .. }));
        assert_eq!(gateway.sent_payments().len(), 1);

        // Validated late: completed without a second payment
        gateway.set_status(&hash, PaymentStatus::Validated);
        queue.retry_pending(&gateway).await;
        assert_eq!(
            queue.get(EntryId(1)).unwrap().status,
            PayoutStatus::Completed { tx_hash: hash }
        );
        assert_eq!(gateway.sent_payments().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_outcome_not_found_is_resent() {
        let gateway = SimulatedGateway::new("https://pay.example");
        gateway.script_send(SendOutcome::TimeOut {
            status: PaymentStatus::NotFound,
        });
        let queue = queue();
        queue.enqueue(EntryId(1), UserId(1), 40, destination());
        queue.send(&gateway, EntryId(1)).await;

        queue.retry_pending(&gateway).await;

        assert!(matches!(queue.get(EntryId(1)).unwrap().status, PayoutStatus::Completed { .. }));
        assert_eq!(gateway.sent_payments().len(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_need_operator() {
        let gateway = SimulatedGateway::new("https://pay.example");
        for _ in 0..3 {
            gateway.script_send(SendOutcome::Reject("tecPATH_DRY".to_string()));
        }
        let queue = queue();
        queue.enqueue(EntryId(1), UserId(1), 40, destination());

        queue.send(&gateway, EntryId(1)).await;
        queue.retry_pending(&gateway).await;
        queue.retry_pending(&gateway).await;

        let task = queue.get(EntryId(1)).unwrap();
        assert!(matches!(task.status, PayoutStatus::NeedsOperator { .. }));
        assert_eq!(task.attempts, 3);

        // Not retried any further
        assert_eq!(queue.retry_pending(&gateway).await, 0);
    }

    #[tokio::test]
    async fn test_manual_payouts_are_never_sent() {
        let gateway = SimulatedGateway::new("https://pay.example");
        let queue = queue();
        queue.enqueue_manual(EntryId(7), UserId(1), 40);

        assert_eq!(queue.send(&gateway, EntryId(7)).await, None);
        assert_eq!(queue.retry_pending(&gateway).await, 0);
        assert_eq!(queue.get(EntryId(7)).unwrap().status, PayoutStatus::Manual);
        assert!(gateway.sent_payments().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recent_unknown_tasks_wait_before_recheck() {
        let gateway = SimulatedGateway::new("https://pay.example");
        gateway.script_send(SendOutcome::TimeOut {
            status: PaymentStatus::NotFound,
        });
        let queue = PayoutQueue::new(3, Duration::from_secs(120));
        queue.enqueue(EntryId(1), UserId(1), 40, destination());
        queue.send(&gateway, EntryId(1)).await;

        assert_eq!(queue.retry_pending(&gateway).await, 0);

        tokio::time::advance(Duration::from_secs(121)).await;
        assert_eq!(queue.retry_pending(&gateway).await, 1);
    }
}
