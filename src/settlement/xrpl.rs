//! Settlement gateway backed by an XRPL node
//!
//! Requests (balance, sign, submit, transaction lookup) share one lazily
//! connected `RpcConnection`. Each watched address gets its own long-lived
//! subscription socket, driven by a background task that reconnects after
//! transport loss and backfills from the last delivered ledger with
//! `account_tx`, so no validated payment is skipped across reconnects. The
//! first backfill starts at the ledger the address was bound at; history from
//! before the binding is never read.
//!
//! The node is expected to be operated by the custodian: payments are signed
//! by the node with the custody seed (`sign`), so the hash is known before
//! the signed blob is submitted.

use super::rpc::{command_frame, response_result, RpcConnection, RpcError, WsStream};
use super::{topup_url, SettlementGateway, EVENT_BUFFER};
use crate::types::{
    ConfirmationStatus, ExternalAddress, ExternalBalance, ExternalPaymentEvent, PaymentReceipt,
    PaymentStatus, TokenAmount, TxHash, UserId, WalletError,
};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Ledgers a signed payment stays valid for (`LastLedgerSequence`)
const VALIDITY_WINDOW: u64 = 10;

/// `account_tx` range starting past the newest validated ledger
const RANGE_AHEAD: &str = "lgrIdxsInvalid";

const SUBSCRIBE_ID: u64 = 1;
const BACKFILL_ID: u64 = 2;
const BACKFILL_PAGE: u64 = 200;

/// Custody seed of the sending wallet
///
/// Never printed; `Debug` is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningSeed(String);

impl SigningSeed {
    /// `None` for an empty or blank seed
    pub fn new(seed: &str) -> Option<Self> {
        let seed = seed.trim();
        if seed.is_empty() {
            None
        } else {
            Some(SigningSeed(seed.to_string()))
        }
    }

    fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SigningSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningSeed(***)")
    }
}

#[derive(Debug, Clone)]
pub struct XrplConfig {
    /// WebSocket endpoint of the node, e.g. `ws://127.0.0.1:6006`
    pub url: String,
    /// Custody wallet payments are sent from
    pub sender: ExternalAddress,
    pub seed: SigningSeed,
    pub request_timeout: Duration,
    /// Bounded wait for a submitted payment to be validated
    pub confirmation_timeout: Duration,
    pub poll_interval: Duration,
    pub reconnect_delay: Duration,
    /// Base URL of the external top-up provider
    pub topup_url: String,
}

#[derive(Debug)]
struct Inner {
    config: XrplConfig,
    rpc: RpcConnection,
    shutdown: CancellationToken,
}

/// XRPL implementation of `SettlementGateway`
#[derive(Debug, Clone)]
pub struct XrplGateway {
    inner: Arc<Inner>,
}

impl XrplGateway {
    /// Create the gateway; no connection is opened until first use
    pub fn new(config: XrplConfig) -> Self {
        let rpc = RpcConnection::new(config.url.clone(), config.request_timeout);
        Self {
            inner: Arc::new(Inner {
                config,
                rpc,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    async fn await_validation(&self, tx_hash: &TxHash) -> Result<(), WalletError> {
        loop {
            match self.payment_status(tx_hash).await {
                Ok(PaymentStatus::Validated) => return Ok(()),
                Ok(PaymentStatus::Failed(result)) => {
                    return Err(WalletError::settlement_failed(
                        format!("payment {} failed: {}", tx_hash, result),
                        None,
                    ))
                }
                Ok(PaymentStatus::Pending) | Ok(PaymentStatus::NotFound) => {}
                Err(e) => debug!(hash = %tx_hash, error = %e, "Validation poll failed"),
            }
            sleep(self.inner.config.poll_interval).await;
        }
    }
}

#[async_trait]
impl SettlementGateway for XrplGateway {
    async fn query_balance(&self, address: &ExternalAddress) -> ExternalBalance {
        let result = self
            .inner
            .rpc
            .request(
                "account_info",
                json!({"account": address.as_str(), "ledger_index": "validated"}),
            )
            .await;

        match result {
            Ok(result) => match parse_drops(&result["account_data"]["Balance"]) {
                Some(drops) => ExternalBalance::Known(drops),
                None => {
                    warn!(address = %address, "account_info returned no usable balance");
                    ExternalBalance::Unknown
                }
            },
            // Unfunded accounts do not exist on the ledger yet
            Err(e) if e.code() == Some("actNotFound") => ExternalBalance::Known(0),
            Err(e) => {
                warn!(address = %address, error = %e, "External balance unavailable");
                ExternalBalance::Unknown
            }
        }
    }

    async fn send_payment(
        &self,
        amount: TokenAmount,
        destination: &ExternalAddress,
    ) -> Result<PaymentReceipt, WalletError> {
        let config = &self.inner.config;
        let not_sent = |stage: &str, e: RpcError| {
            WalletError::settlement_failed(format!("{}: {}", stage, e), None)
        };

        let current = self
            .inner
            .rpc
            .request("ledger_current", json!({}))
            .await
            .map_err(|e| not_sent("ledger_current", e))?;
        let current = current["ledger_current_index"]
            .as_u64()
            .ok_or_else(|| WalletError::settlement_failed("ledger_current without index", None))?;

        let tx_json = payment_tx_json(&config.sender, destination, amount, current + VALIDITY_WINDOW);
        let signed = self
            .inner
            .rpc
            .request(
                "sign",
                json!({"tx_json": tx_json, "secret": config.seed.expose(), "fee_mult_max": 1000}),
            )
            .await
            .map_err(|e| not_sent("sign", e))?;
        let (tx_hash, tx_blob) = signed_payment(&signed)?;

        // From here on the payment may reach the network, so failures carry the hash
        let submitted = self
            .inner
            .rpc
            .request("submit", json!({"tx_blob": tx_blob}))
            .await
            .map_err(|e| WalletError::settlement_failed(format!("submit: {}", e), Some(tx_hash.clone())))?;
        classify_submit(&submitted, &tx_hash)?;
        info!(hash = %tx_hash, amount, destination = %destination, "Payment submitted");

        match timeout(config.confirmation_timeout, self.await_validation(&tx_hash)).await {
            Ok(Ok(())) => {
                info!(hash = %tx_hash, "Payment validated");
                Ok(PaymentReceipt { tx_hash })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(WalletError::settlement_failed(
                format!("not validated within {:?}", config.confirmation_timeout),
                Some(tx_hash),
            )),
        }
    }

    async fn payment_status(&self, tx_hash: &TxHash) -> Result<PaymentStatus, WalletError> {
        match self
            .inner
            .rpc
            .request("tx", json!({"transaction": tx_hash.as_str()}))
            .await
        {
            Ok(result) => Ok(classify_tx(&result)),
            Err(e) if e.code() == Some("txnNotFound") => Ok(PaymentStatus::NotFound),
            Err(e) => Err(WalletError::settlement_failed(
                format!("tx lookup: {}", e),
                Some(tx_hash.clone()),
            )),
        }
    }

    async fn validated_ledger(&self) -> Result<u64, WalletError> {
        self.inner
            .validated_ledger()
            .await
            .map_err(|e| WalletError::settlement_failed(format!("ledger: {}", e), None))
    }

    fn subscribe(
        &self,
        address: ExternalAddress,
        from_ledger: Option<u64>,
    ) -> mpsc::Receiver<ExternalPaymentEvent> {
        let (events, receiver) = mpsc::channel(EVENT_BUFFER);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.watch(address, from_ledger, events).await });
        receiver
    }

    async fn topup_redirect(
        &self,
        user: UserId,
        address: Option<&ExternalAddress>,
    ) -> Result<String, WalletError> {
        Ok(topup_url(&self.inner.config.topup_url, user, address))
    }

    async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.rpc.close().await;
    }
}

/// Resume point of a subscription
#[derive(Debug)]
struct Cursor {
    /// First ledger the next backfill reads (inclusive)
    ///
    /// Starts at the binding ledger and then follows the highest validated
    /// ledger delivered. `None` until the node has been asked for its
    /// validated ledger.
    ledger: Option<u64>,
    /// Whether the current connection finished its backfill
    caught_up: bool,
}

impl Cursor {
    fn starting_at(ledger: Option<u64>) -> Self {
        Cursor {
            ledger,
            caught_up: false,
        }
    }
}

impl Inner {
    async fn validated_ledger(&self) -> Result<u64, RpcError> {
        let result = self
            .rpc
            .request("ledger", json!({"ledger_index": "validated"}))
            .await?;
        parse_ledger_index(&result)
            .ok_or_else(|| RpcError::Malformed("ledger response without index".to_string()))
    }

    async fn watch(
        &self,
        address: ExternalAddress,
        from_ledger: Option<u64>,
        events: mpsc::Sender<ExternalPaymentEvent>,
    ) {
        let mut cursor = Cursor::starting_at(from_ledger);
        let mut attempt = 0u32;

        loop {
            if self.shutdown.is_cancelled() || events.is_closed() {
                break;
            }

            info!(address = %address, url = %self.config.url, "Opening payment subscription");
            match self.listen(&address, &events, &mut cursor).await {
                Ok(()) => break,
                Err(e) => {
                    attempt += 1;
                    error!(address = %address, error = %e, attempt, "Payment subscription lost");
                }
            }

            tokio::select! {
                _ = sleep(self.config.reconnect_delay) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        info!(address = %address, "Payment subscription stopped");
    }

    /// Run one connection until shutdown (`Ok`) or transport loss (`Err`)
    async fn listen(
        &self,
        address: &ExternalAddress,
        events: &mpsc::Sender<ExternalPaymentEvent>,
        cursor: &mut Cursor,
    ) -> Result<(), RpcError> {
        let from_ledger = match cursor.ledger {
            Some(ledger) => ledger,
            None => {
                let next = self.validated_ledger().await? + 1;
                info!(address = %address, ledger = next, "No start ledger recorded, watching from the next ledger");
                cursor.ledger = Some(next);
                next
            }
        };

        let (mut socket, _) = timeout(self.config.request_timeout, connect_async(self.config.url.as_str()))
            .await
            .map_err(|_| RpcError::Timeout(self.config.request_timeout))?
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        cursor.caught_up = false;
        send_frame(
            &mut socket,
            command_frame(SUBSCRIBE_ID, "subscribe", json!({"accounts": [address.as_str()]})),
        )
        .await?;
        send_frame(&mut socket, backfill_frame(address, from_ledger, None)).await?;

        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = socket.close(None).await;
                    return Ok(());
                }
                _ = events.closed() => {
                    let _ = socket.close(None).await;
                    return Ok(());
                }
                message = socket.next() => message,
            };

            let text = match message {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) => {
                    return Err(RpcError::Transport("closed by peer".to_string()))
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(RpcError::Transport(e.to_string())),
                None => return Err(RpcError::Transport("stream ended".to_string())),
            };

            let frame: Value = match serde_json::from_str(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "Ignoring undecodable subscription frame");
                    continue;
                }
            };

            let kind = frame.get("type").and_then(Value::as_str).unwrap_or_default().to_string();
            match kind.as_str() {
                "transaction" => {
                    if let Some(event) = parse_inbound_payment(&frame, address) {
                        // Live events may overtake the backfill; only the
                        // backfill advances the cursor until it completes.
                        let advance = cursor.caught_up;
                        if !deliver(events, event, cursor, advance).await {
                            return Ok(());
                        }
                    }
                }
                "response" => match frame.get("id").and_then(Value::as_u64) {
                    Some(SUBSCRIBE_ID) => {
                        response_result(frame)?;
                        info!(address = %address, "Payment subscription active");
                    }
                    Some(BACKFILL_ID) => {
                        let result = match response_result(frame) {
                            Ok(result) => result,
                            // No ledger validated since the resume point yet
                            Err(e) if e.code() == Some(RANGE_AHEAD) => json!({}),
                            Err(e) => return Err(e),
                        };
                        let transactions = result["transactions"].as_array().cloned().unwrap_or_default();
                        for item in &transactions {
                            if let Some(event) = parse_inbound_payment(item, address) {
                                if !deliver(events, event, cursor, true).await {
                                    return Ok(());
                                }
                            }
                        }
                        match result.get("marker").filter(|marker| !marker.is_null()) {
                            Some(marker) => {
                                let next = backfill_frame(address, from_ledger, Some(marker.clone()));
                                send_frame(&mut socket, next).await?;
                            }
                            None => {
                                cursor.caught_up = true;
                                debug!(address = %address, ledger = ?cursor.ledger, "Backfill complete");
                            }
                        }
                    }
                    _ => {}
                },
                _ => {}
            }
        }
    }
}

async fn send_frame(socket: &mut WsStream, frame: Value) -> Result<(), RpcError> {
    socket
        .send(Message::Text(frame.to_string()))
        .await
        .map_err(|e| RpcError::Transport(e.to_string()))
}

/// Forward a confirmed event; `false` once the receiver is gone
async fn deliver(
    events: &mpsc::Sender<ExternalPaymentEvent>,
    event: ExternalPaymentEvent,
    cursor: &mut Cursor,
    advance: bool,
) -> bool {
    if !event.is_confirmed() {
        return true;
    }
    if advance {
        if let Some(ledger) = event.ledger_index {
            cursor.ledger = Some(cursor.ledger.map_or(ledger, |seen| seen.max(ledger)));
        }
    }
    events.send(event).await.is_ok()
}

/// `account_tx` from `from_ledger` (inclusive) to the newest validated ledger
///
/// Follow-up pages repeat the same range together with the node's marker.
fn backfill_frame(address: &ExternalAddress, from_ledger: u64, marker: Option<Value>) -> Value {
    let mut params = json!({
        "account": address.as_str(),
        "ledger_index_min": from_ledger,
        "ledger_index_max": -1,
        "forward": true,
        "limit": BACKFILL_PAGE,
    });
    if let Some(marker) = marker {
        params["marker"] = marker;
    }
    command_frame(BACKFILL_ID, "account_tx", params)
}

fn payment_tx_json(
    sender: &ExternalAddress,
    destination: &ExternalAddress,
    amount: TokenAmount,
    last_ledger: u64,
) -> Value {
    json!({
        "TransactionType": "Payment",
        "Account": sender.as_str(),
        "Destination": destination.as_str(),
        "Amount": amount.to_string(),
        "LastLedgerSequence": last_ledger,
    })
}

/// Amount in drops; issued-currency amounts (objects) are not the settlement asset
fn parse_drops(value: &Value) -> Option<TokenAmount> {
    value.as_str().and_then(|drops| drops.parse().ok())
}

/// `(hash, blob)` from a `sign` result
fn signed_payment(result: &Value) -> Result<(TxHash, String), WalletError> {
    let hash = result["tx_json"]["hash"].as_str();
    let blob = result["tx_blob"].as_str();
    match (hash, blob) {
        (Some(hash), Some(blob)) => Ok((TxHash::new(hash), blob.to_string())),
        _ => Err(WalletError::settlement_failed("sign returned no signed blob", None)),
    }
}

/// Accept `tes`/`ter` preliminary results
///
/// Only a `tem` result proves the signed transaction can never be applied.
/// Every other rejection is provisional (`tef`/`tel` may still be relayed, a
/// `tec` is applied with its fee claimed), so the hash is kept and the
/// outcome must be looked up before paying again.
fn classify_submit(result: &Value, tx_hash: &TxHash) -> Result<(), WalletError> {
    let code = result["engine_result"].as_str().unwrap_or("unknown");
    if code == "tesSUCCESS" || code.starts_with("ter") {
        return Ok(());
    }
    let message = result["engine_result_message"].as_str().unwrap_or_default();
    let tx_hash = if code.starts_with("tem") {
        None
    } else {
        Some(tx_hash.clone())
    };
    Err(WalletError::settlement_failed(format!("{}: {}", code, message), tx_hash))
}

/// Index of a `ledger` response; API v1 nests it as a string
fn parse_ledger_index(result: &Value) -> Option<u64> {
    result["ledger_index"].as_u64().or_else(|| {
        result["ledger"]["ledger_index"]
            .as_str()
            .and_then(|index| index.parse().ok())
    })
}

fn classify_tx(result: &Value) -> PaymentStatus {
    if result["validated"].as_bool() != Some(true) {
        return PaymentStatus::Pending;
    }
    match result["meta"]["TransactionResult"].as_str() {
        Some("tesSUCCESS") => PaymentStatus::Validated,
        Some(code) => PaymentStatus::Failed(code.to_string()),
        None => PaymentStatus::Failed("missing TransactionResult".to_string()),
    }
}

/// Decode a stream `transaction` message or an `account_tx` item
///
/// Returns `None` unless it is a successful XRP payment into `watched`.
fn parse_inbound_payment(frame: &Value, watched: &ExternalAddress) -> Option<ExternalPaymentEvent> {
    let tx = frame
        .get("tx_json")
        .or_else(|| frame.get("transaction"))
        .or_else(|| frame.get("tx"))?;

    if tx.get("TransactionType")?.as_str()? != "Payment" {
        return None;
    }
    if tx.get("Destination")?.as_str()? != watched.as_str() {
        return None;
    }

    let meta = frame.get("meta").or_else(|| frame.get("metaData"))?;
    if meta.get("TransactionResult")?.as_str()? != "tesSUCCESS" {
        return None;
    }
    let amount = meta
        .get("delivered_amount")
        .or_else(|| meta.get("DeliveredAmount"))
        .and_then(parse_drops)?;
    if amount == 0 {
        return None;
    }

    let hash = frame
        .get("hash")
        .or_else(|| tx.get("hash"))
        .and_then(Value::as_str)?;
    let ledger_index = frame
        .get("ledger_index")
        .or_else(|| tx.get("ledger_index"))
        .and_then(Value::as_u64);
    let status = if frame.get("validated").and_then(Value::as_bool) == Some(true) {
        ConfirmationStatus::Confirmed
    } else {
        ConfirmationStatus::Pending
    };

    Some(ExternalPaymentEvent {
        tx_hash: TxHash::new(hash),
        destination: watched.clone(),
        amount,
        status,
        ledger_index,
    })
}
