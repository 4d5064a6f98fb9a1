//! Mapping of wallet errors onto HTTP responses
//!
//! Every error body is `{"error": <code>, "message": <text>}`.

use crate::types::WalletError;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{error, warn};

#[derive(Debug)]
pub enum ApiError {
    Wallet(WalletError),
    /// Body that is not valid JSON for the route
    BadRequest(String),
}

impl ApiError {
    /// HTTP status and stable error code
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        let wallet_error = match self {
            ApiError::BadRequest(_) => return (StatusCode::BAD_REQUEST, "invalid_request"),
            ApiError::Wallet(error) => error,
        };
        match wallet_error {
            WalletError::InvalidAmount { .. } | WalletError::ArithmeticOverflow { .. } => {
                (StatusCode::BAD_REQUEST, "invalid_amount")
            }
            WalletError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            WalletError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            WalletError::InsufficientBalance { .. } => (StatusCode::CONFLICT, "insufficient_balance"),
            WalletError::DuplicateSettlement { .. } => (StatusCode::CONFLICT, "duplicate_settlement"),
            WalletError::AccountInactive { .. }
            | WalletError::AccountNotEmpty { .. }
            | WalletError::AddressAlreadyBound { .. }
            | WalletError::AddressInUse { .. }
            | WalletError::InvalidOrderTransition { .. } => (StatusCode::CONFLICT, "conflict"),
            WalletError::SettlementFailed { .. } => (StatusCode::BAD_GATEWAY, "settlement_failed"),
            WalletError::StorageUnavailable { .. } => (StatusCode::SERVICE_UNAVAILABLE, "storage_unavailable"),
            WalletError::Config { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl From<WalletError> for ApiError {
    fn from(error: WalletError) -> Self {
        ApiError::Wallet(error)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = match &self {
            ApiError::Wallet(error) => error.to_string(),
            ApiError::BadRequest(message) => message.clone(),
        };

        if status.is_server_error() {
            error!(code, message = %message, "Request failed");
        } else {
            warn!(code, message = %message, "Request rejected");
        }

        (status, Json(json!({ "error": code, "message": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Pool, TxHash, UserId};
    use rstest::rstest;

    #[rstest]
    #[case::invalid_amount(WalletError::invalid_amount("x"), StatusCode::BAD_REQUEST, "invalid_amount")]
    #[case::unauthorized(WalletError::Unauthorized, StatusCode::UNAUTHORIZED, "unauthorized")]
    #[case::not_found(WalletError::account_not_found(UserId(1)), StatusCode::NOT_FOUND, "not_found")]
    #[case::insufficient(
        WalletError::insufficient_balance(UserId(1), Pool::Spendable, 1, 2),
        StatusCode::CONFLICT,
        "insufficient_balance"
    )]
    #[case::duplicate(WalletError::duplicate_settlement(TxHash::new("A")), StatusCode::CONFLICT, "duplicate_settlement")]
    #[case::inactive(WalletError::AccountInactive { user: UserId(1) }, StatusCode::CONFLICT, "conflict")]
    #[case::not_empty(
        WalletError::AccountNotEmpty { user: UserId(1), spendable: 3, staked: 0 },
        StatusCode::CONFLICT,
        "conflict"
    )]
    #[case::settlement(WalletError::settlement_failed("x", None), StatusCode::BAD_GATEWAY, "settlement_failed")]
    #[case::storage(
        WalletError::storage_unavailable("x"),
        StatusCode::SERVICE_UNAVAILABLE,
        "storage_unavailable"
    )]
    fn test_error_mapping(#[case] error: WalletError, #[case] status: StatusCode, #[case] code: &str) {
        assert_eq!(ApiError::from(error).status_and_code(), (status, code));
    }
}
