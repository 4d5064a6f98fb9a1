//! In-process settlement gateway
//!
//! Used when the service runs in explicit simulated mode and by tests. It
//! keeps per-address balances in memory, replays scripted send outcomes and
//! lets callers inject inbound payment events into active subscriptions.
//! Subscriptions honour their start ledger the way a node backfill does.

use super::{topup_url, SettlementGateway, EVENT_BUFFER};
use crate::types::{
    ExternalAddress, ExternalBalance, ExternalPaymentEvent, PaymentReceipt, PaymentStatus,
    TokenAmount, TxHash, UserId, WalletError,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Scripted result of the next `send_payment` call
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Validated payment
    Succeed,
    /// Rejected before reaching the network
    Reject(String),
    /// Submitted but not validated in time; the status lookup reports `status`
    TimeOut { status: PaymentStatus },
}

/// A payment the gateway was asked to send
#[derive(Debug, Clone, PartialEq)]
pub struct SentPayment {
    pub amount: TokenAmount,
    pub destination: ExternalAddress,
    pub tx_hash: Option<TxHash>,
}

#[derive(Debug)]
struct Subscription {
    events: mpsc::Sender<ExternalPaymentEvent>,
    from_ledger: u64,
}

#[derive(Debug)]
pub struct SimulatedGateway {
    balances: DashMap<ExternalAddress, TokenAmount>,
    offline: AtomicBool,
    outcomes: Mutex<VecDeque<SendOutcome>>,
    sent: Mutex<Vec<SentPayment>>,
    statuses: DashMap<TxHash, PaymentStatus>,
    subscribers: DashMap<ExternalAddress, Vec<Subscription>>,
    validated_ledger: AtomicU64,
    next_hash: AtomicU64,
    topup_base: String,
}

impl SimulatedGateway {
    pub fn new(topup_base: impl Into<String>) -> Self {
        Self {
            balances: DashMap::new(),
            offline: AtomicBool::new(false),
            outcomes: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            statuses: DashMap::new(),
            subscribers: DashMap::new(),
            validated_ledger: AtomicU64::new(0),
            next_hash: AtomicU64::new(1),
            topup_base: topup_base.into(),
        }
    }

    pub fn set_balance(&self, address: &ExternalAddress, amount: TokenAmount) {
        self.balances.insert(address.clone(), amount);
    }

    /// While offline every balance query reports `Unknown`
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Queue the outcome of a future send; unscripted sends succeed
    pub fn script_send(&self, outcome: SendOutcome) {
        self.outcomes.lock().push_back(outcome);
    }

    /// Override what `payment_status` reports for a hash
    pub fn set_status(&self, tx_hash: &TxHash, status: PaymentStatus) {
        self.statuses.insert(tx_hash.clone(), status);
    }

    /// Advance (or rewind) the ledger reported by `validated_ledger`
    pub fn set_validated_ledger(&self, ledger: u64) {
        self.validated_ledger.store(ledger, Ordering::SeqCst);
    }

    pub fn sent_payments(&self) -> Vec<SentPayment> {
        self.sent.lock().clone()
    }

    /// Deliver an event to every live subscription on its destination
    ///
    /// Subscriptions that start after the event's ledger do not see it.
    /// Returns how many subscribers received it.
    pub async fn inject(&self, event: ExternalPaymentEvent) -> usize {
        let senders: Vec<_> = self
            .subscribers
            .get(&event.destination)
            .map(|subscriptions| {
                subscriptions
                    .iter()
                    .filter(|sub| event.ledger_index.map_or(true, |ledger| ledger >= sub.from_ledger))
                    .map(|sub| sub.events.clone())
                    .collect()
            })
            .unwrap_or_default();

        let mut delivered = 0;
        for sender in senders {
            if sender.send(event.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        debug!(hash = %event.tx_hash, delivered, "Injected external payment");
        delivered
    }

    fn mint_hash(&self) -> TxHash {
        let n = self.next_hash.fetch_add(1, Ordering::Relaxed);
        TxHash::new(format!("SIM{:061X}", n))
    }
}

#[async_trait]
impl SettlementGateway for SimulatedGateway {
    async fn query_balance(&self, address: &ExternalAddress) -> ExternalBalance {
        if self.offline.load(Ordering::SeqCst) {
            return ExternalBalance::Unknown;
        }
        ExternalBalance::Known(self.balances.get(address).map(|b| *b).unwrap_or(0))
    }

    async fn send_payment(
        &self,
        amount: TokenAmount,
        destination: &ExternalAddress,
    ) -> Result<PaymentReceipt, WalletError> {
        let outcome = self.outcomes.lock().pop_front().unwrap_or(SendOutcome::Succeed);

        let (result, tx_hash) = match outcome {
            SendOutcome::Succeed => {
                let tx_hash = self.mint_hash();
                self.statuses.insert(tx_hash.clone(), PaymentStatus::Validated);
                self.balances
                    .entry(destination.clone())
                    .and_modify(|balance| *balance = balance.saturating_add(amount))
                    .or_insert(amount);
                (Ok(PaymentReceipt { tx_hash: tx_hash.clone() }), Some(tx_hash))
            }
            SendOutcome::Reject(reason) => (Err(WalletError::settlement_failed(reason, None)), None),
            SendOutcome::TimeOut { status } => {
                let tx_hash = self.mint_hash();
                self.statuses.insert(tx_hash.clone(), status);
                (
                    Err(WalletError::settlement_failed(
                        "not validated in time",
                        Some(tx_hash.clone()),
                    )),
                    Some(tx_hash),
                )
            }
        };

        self.sent.lock().push(SentPayment {
            amount,
            destination: destination.clone(),
            tx_hash,
        });
        result
    }

    async fn payment_status(&self, tx_hash: &TxHash) -> Result<PaymentStatus, WalletError> {
        Ok(self
            .statuses
            .get(tx_hash)
            .map(|status| status.value().clone())
            .unwrap_or(PaymentStatus::NotFound))
    }

    async fn validated_ledger(&self) -> Result<u64, WalletError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(WalletError::settlement_failed("simulated network is offline", None));
        }
        Ok(self.validated_ledger.load(Ordering::SeqCst))
    }

    fn subscribe(
        &self,
        address: ExternalAddress,
        from_ledger: Option<u64>,
    ) -> mpsc::Receiver<ExternalPaymentEvent> {
        let (events, receiver) = mpsc::channel(EVENT_BUFFER);
        let from_ledger =
            from_ledger.unwrap_or_else(|| self.validated_ledger.load(Ordering::SeqCst) + 1);
        let mut subscriptions = self.subscribers.entry(address.clone()).or_default();
        subscriptions.retain(|existing| !existing.events.is_closed());
        subscriptions.push(Subscription { events, from_ledger });
        info!(address = %address, from_ledger, "Simulated subscription opened");
        receiver
    }

    async fn topup_redirect(
        &self,
        user: UserId,
        address: Option<&ExternalAddress>,
    ) -> Result<String, WalletError> {
        Ok(topup_url(&self.topup_base, user, address))
    }

    async fn shutdown(&self) {
        // Dropping the senders ends every subscription
        self.subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConfirmationStatus;

    fn address(raw: &str) -> ExternalAddress {
        ExternalAddress::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_query_balance_known_and_offline() {
        let gateway = SimulatedGateway::new("https://pay.example");
        gateway.set_balance(&address("rA"), 75);

        assert_eq!(gateway.query_balance(&address("rA")).await, ExternalBalance::Known(75));
        assert_eq!(gateway.query_balance(&address("rB")).await, ExternalBalance::Known(0));

        gateway.set_offline(true);
        assert_eq!(gateway.query_balance(&address("rA")).await, ExternalBalance::Unknown);
    }

    #[tokio::test]
    async fn test_scripted_send_outcomes() {
        let gateway = SimulatedGateway::new("https://pay.example");
        gateway.script_send(SendOutcome::Reject("tecNO_DST".to_string()));
        gateway.script_send(SendOutcome::TimeOut {
            status: PaymentStatus::Pending,
        });

        let rejected = gateway.send_payment(5, &address("rA")).await.unwrap_err();
        assert!(matches!(rejected, WalletError::SettlementFailed { tx_hash: None, .. }));

        let timed_out = gateway.send_payment(5, &address("rA")).await.unwrap_err();
        let WalletError::SettlementFailed { tx_hash: Some(hash), .. } = timed_out else {
            panic!("expected a hash for a submitted payment");
        };
        assert_eq!(gateway.payment_status(&hash).await.unwrap(), PaymentStatus::Pending);

        let receipt = gateway.send_payment(5, &address("rA")).await.unwrap();
        assert_eq!(
            gateway.payment_status(&receipt.tx_hash).await.unwrap(),
            PaymentStatus::Validated
        );
        assert_eq!(gateway.sent_payments().len(), 3);
        assert_eq!(gateway.query_balance(&address("rA")).await, ExternalBalance::Known(5));
    }

    #[tokio::test]
    async fn test_inject_reaches_subscribers_of_destination_only() {
        let gateway = SimulatedGateway::new("https://pay.example");
        let mut watched = gateway.subscribe(address("rA"), Some(1));
        let mut other = gateway.subscribe(address("rB"), Some(1));

        let event = ExternalPaymentEvent {
            tx_hash: TxHash::new("H1"),
            destination: address("rA"),
            amount: 9,
            status: ConfirmationStatus::Confirmed,
            ledger_index: Some(1),
        };
        assert_eq!(gateway.inject(event.clone()).await, 1);

        assert_eq!(watched.recv().await, Some(event));
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscription_ignores_ledgers_before_its_start() {
        let gateway = SimulatedGateway::new("https://pay.example");
        gateway.set_validated_ledger(40);
        let mut receiver = gateway.subscribe(address("rA"), None);

        let before = ExternalPaymentEvent {
            tx_hash: TxHash::new("OLD"),
            destination: address("rA"),
            amount: 9,
            status: ConfirmationStatus::Confirmed,
            ledger_index: Some(40),
        };
        let after = ExternalPaymentEvent {
            tx_hash: TxHash::new("NEW"),
            ledger_index: Some(41),
            ..before.clone()
        };

        assert_eq!(gateway.inject(before).await, 0);
        assert_eq!(gateway.inject(after.clone()).await, 1);
        assert_eq!(receiver.recv().await, Some(after));
        assert_eq!(gateway.validated_ledger().await.unwrap(), 40);
    }

    #[tokio::test]
    async fn test_shutdown_closes_subscriptions() {
        let gateway = SimulatedGateway::new("https://pay.example");
        let mut receiver = gateway.subscribe(address("rA"), None);

        gateway.shutdown().await;

        assert_eq!(receiver.recv().await, None);
    }
}
