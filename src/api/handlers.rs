//! HTTP handlers
//!
//! | Endpoint | Method | Description |
//! |----------|--------|-------------|
//! | `/health` | GET | Liveness |
//! | `/accounts` | POST | Registration hook, opens the caller's wallet |
//! | `/accounts` | DELETE | Deactivates the caller's emptied wallet |
//! | `/wallet` | GET | Pools, external balance and APY |
//! | `/wallet/topup` | POST | Redirect URL at the top-up provider |
//! | `/wallet/withdraw` | POST | Debit and queue a payout |
//! | `/wallet/stake` | POST | Spendable to staked |
//! | `/wallet/unstake` | POST | Staked to spendable |
//! | `/wallet/address` | POST | Bind the external address and watch it |
//! | `/wallet/history` | GET | Ledger entries in commit order |
//! | `/orders/confirm` | POST | Price, record and pay an order |
//! | `/orders/:order_id` | GET | One of the caller's orders |
//! | `/webhooks/topup` | POST | Top-up provider confirms a payment (shared secret) |

use super::error::ApiError;
use super::principal::Principal;
use super::AppState;
use crate::core::{Balances, CartLine, WalletOverview, WithdrawalMethod};
use crate::types::{
    EntryKind, ExternalAddress, LedgerEntry, LineItem, Order, OrderId, OrderStatus, TokenAmount,
    UserId, WalletError,
};
use crate::watcher::WatchState;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Header carrying the top-up provider's shared secret
pub const WEBHOOK_TOKEN_HEADER: &str = "x-webhook-token";

// ════════════════════════════════════════════════════════════════════════════
// REQUEST/RESPONSE TYPES
// ════════════════════════════════════════════════════════════════════════════

/// Body of stake and unstake
#[derive(Debug, Clone, Deserialize)]
pub struct AmountReq {
    /// Signed so that negative input is reported as an invalid amount
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MethodReq {
    Xrpl,
    Bank,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WithdrawReq {
    pub amount: i64,
    pub method: MethodReq,
    #[serde(default)]
    pub destination: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmOrderReq {
    pub line_items: Vec<CartLine>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkAddressReq {
    pub address: String,
}

/// Provider confirmation of a completed top-up payment
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopupConfirmedReq {
    pub user_id: u64,
    pub amount: i64,
    /// The provider's payment id; a repeated id is never credited twice
    pub provider_ref: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopupCreditRes {
    pub entry_id: u64,
    pub spendable: TokenAmount,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawRes {
    pub accepted: bool,
    pub entry_id: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopupRes {
    pub redirect_url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressRes {
    pub address: String,
    pub watch: WatchState,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryRes {
    pub id: u64,
    pub kind: EntryKind,
    pub amount: TokenAmount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<Uuid>,
    pub spendable_after: TokenAmount,
    pub staked_after: TokenAmount,
    pub created_at: DateTime<Utc>,
}

impl From<LedgerEntry> for EntryRes {
    fn from(entry: LedgerEntry) -> Self {
        EntryRes {
            id: entry.id.0,
            kind: entry.kind,
            amount: entry.amount,
            external_ref: entry.external_ref.map(|hash| hash.0),
            order_id: entry.order_id.map(|id| id.0),
            spendable_after: entry.spendable_after,
            staked_after: entry.staked_after,
            created_at: entry.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRes {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub total: TokenAmount,
    pub line_items: Vec<LineItem>,
    pub created_at: DateTime<Utc>,
}

impl From<Order> for OrderRes {
    fn from(order: Order) -> Self {
        OrderRes {
            order_id: order.id.0,
            status: order.status,
            total: order.total,
            line_items: order.line_items,
            created_at: order.created_at,
        }
    }
}

fn token_amount(amount: i64) -> Result<TokenAmount, WalletError> {
    match TokenAmount::try_from(amount) {
        Ok(amount) if amount > 0 => Ok(amount),
        _ => Err(WalletError::invalid_amount(format!("amount must be positive, got {}", amount))),
    }
}

// ════════════════════════════════════════════════════════════════════════════
// HANDLERS
// ════════════════════════════════════════════════════════════════════════════

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

pub async fn open_account(
    State(state): State<AppState>,
    Principal(user): Principal,
) -> Result<(StatusCode, Json<Balances>), ApiError> {
    let account = state.engine.open_account(user)?;
    Ok((StatusCode::CREATED, Json(Balances::from(&account))))
}

pub async fn close_account(
    State(state): State<AppState>,
    Principal(user): Principal,
) -> Result<StatusCode, ApiError> {
    state.engine.close_account(user)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn wallet_overview(
    State(state): State<AppState>,
    Principal(user): Principal,
) -> Result<Json<WalletOverview>, ApiError> {
    Ok(Json(state.engine.wallet_overview(user).await?))
}

pub async fn request_topup(
    State(state): State<AppState>,
    Principal(user): Principal,
) -> Result<Json<TopupRes>, ApiError> {
    let redirect_url = state.engine.request_topup(user).await?;
    Ok(Json(TopupRes { redirect_url }))
}

pub async fn request_withdrawal(
    State(state): State<AppState>,
    Principal(user): Principal,
    payload: Result<Json<WithdrawReq>, JsonRejection>,
) -> Result<(StatusCode, Json<WithdrawRes>), ApiError> {
    let Json(req) = payload?;
    let amount = token_amount(req.amount)?;
    let method = match req.method {
        MethodReq::Xrpl => WithdrawalMethod::Xrpl {
            destination: req.destination.as_deref().and_then(ExternalAddress::parse),
        },
        MethodReq::Bank => WithdrawalMethod::Bank,
    };

    let withdrawal = state.engine.request_withdrawal(user, amount, method).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(WithdrawRes {
            accepted: true,
            entry_id: withdrawal.entry.id.0,
        }),
    ))
}

pub async fn stake(
    State(state): State<AppState>,
    Principal(user): Principal,
    payload: Result<Json<AmountReq>, JsonRejection>,
) -> Result<Json<Balances>, ApiError> {
    let Json(req) = payload?;
    Ok(Json(state.engine.stake(user, token_amount(req.amount)?)?))
}

pub async fn unstake(
    State(state): State<AppState>,
    Principal(user): Principal,
    payload: Result<Json<AmountReq>, JsonRejection>,
) -> Result<Json<Balances>, ApiError> {
    let Json(req) = payload?;
    Ok(Json(state.engine.unstake(user, token_amount(req.amount)?)?))
}

pub async fn link_address(
    State(state): State<AppState>,
    Principal(user): Principal,
    payload: Result<Json<LinkAddressReq>, JsonRejection>,
) -> Result<Json<AddressRes>, ApiError> {
    let Json(req) = payload?;
    let address = ExternalAddress::parse(&req.address)
        .ok_or_else(|| ApiError::BadRequest("address must not be empty".to_string()))?;

    let account = state.engine.link_external_address(user, address.clone()).await?;
    state.watcher.watch(address.clone(), account.address_ledger);

    Ok(Json(AddressRes {
        watch: state.watcher.state(&address),
        address: address.to_string(),
    }))
}

pub async fn topup_confirmed(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<TopupConfirmedReq>, JsonRejection>,
) -> Result<Json<TopupCreditRes>, ApiError> {
    let presented = headers
        .get(WEBHOOK_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());
    let authorized = match (&state.topup_secret, presented) {
        (Some(secret), Some(presented)) => secret.matches(presented),
        _ => false,
    };
    if !authorized {
        return Err(WalletError::Unauthorized.into());
    }

    let Json(req) = payload?;
    let entry = state.engine.credit_topup(
        UserId(req.user_id),
        token_amount(req.amount)?,
        &req.provider_ref,
    )?;
    Ok(Json(TopupCreditRes {
        entry_id: entry.id.0,
        spendable: entry.spendable_after,
    }))
}

pub async fn history(
    State(state): State<AppState>,
    Principal(user): Principal,
) -> Result<Json<Vec<EntryRes>>, ApiError> {
    let entries = state.engine.history(user)?;
    Ok(Json(entries.into_iter().map(EntryRes::from).collect()))
}

pub async fn confirm_order(
    State(state): State<AppState>,
    Principal(user): Principal,
    payload: Result<Json<ConfirmOrderReq>, JsonRejection>,
) -> Result<Json<OrderRes>, ApiError> {
    let Json(req) = payload?;
    let order = state.engine.confirm_order(user, req.line_items)?;
    Ok(Json(OrderRes::from(order)))
}

pub async fn get_order(
    State(state): State<AppState>,
    Principal(user): Principal,
    Path(order_id): Path<Uuid>,
) -> Result<Json<OrderRes>, ApiError> {
    let order = state.engine.order(user, OrderId(order_id))?;
    Ok(Json(OrderRes::from(order)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::positive(5, true)]
    #[case::zero(0, false)]
    #[case::negative(-5, false)]
    fn test_token_amount(#[case] amount: i64, #[case] valid: bool) {
        assert_eq!(token_amount(amount).is_ok(), valid);
    }

    #[test]
    fn test_withdraw_request_parsing() {
        let req: WithdrawReq =
            serde_json::from_str(r#"{"amount": 10, "method": "xrpl", "destination": "rX"}"#).unwrap();
        assert_eq!(req.method, MethodReq::Xrpl);
        assert_eq!(req.destination.as_deref(), Some("rX"));

        let bank: WithdrawReq = serde_json::from_str(r#"{"amount": 10, "method": "bank"}"#).unwrap();
        assert_eq!(bank.method, MethodReq::Bank);
        assert_eq!(bank.destination, None);
    }
}
