//! HTTP API
//!
//! A thin axum adapter over `WalletEngine`. Request bodies and responses
//! are camelCase JSON; the caller is identified by the `Principal` extractor.

pub mod error;
pub mod handlers;
pub mod principal;

pub use error::ApiError;
pub use principal::{HeaderPrincipalResolver, Principal, PrincipalResolver, USER_HEADER};

use crate::config::WebhookSecret;
use crate::core::WalletEngine;
use crate::watcher::ReconciliationWatcher;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared state of every handler
#[derive(Clone)]
pub struct AppState {
    pub engine: WalletEngine,
    pub watcher: Arc<ReconciliationWatcher>,
    pub principals: Arc<dyn PrincipalResolver>,
    /// Secret expected on the top-up webhook; `None` refuses every call
    pub topup_secret: Option<WebhookSecret>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/accounts", post(handlers::open_account).delete(handlers::close_account))
        .route("/wallet", get(handlers::wallet_overview))
        .route("/wallet/topup", post(handlers::request_topup))
        .route("/wallet/withdraw", post(handlers::request_withdrawal))
        .route("/wallet/stake", post(handlers::stake))
        .route("/wallet/unstake", post(handlers::unstake))
        .route("/wallet/address", post(handlers::link_address))
        .route("/wallet/history", get(handlers::history))
        .route("/orders/confirm", post(handlers::confirm_order))
        .route("/orders/:order_id", get(handlers::get_order))
        .route("/webhooks/topup", post(handlers::topup_confirmed))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
