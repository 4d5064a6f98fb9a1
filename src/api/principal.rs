//! Authenticated principal of a request
//!
//! Authentication happens upstream; the wallet only resolves the already
//! authenticated user from the request. The default resolver trusts the
//! `x-user-id` header set by the auth middleware in front of the service.

use super::error::ApiError;
use super::AppState;
use crate::types::{UserId, WalletError};
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;

pub const USER_HEADER: &str = "x-user-id";

/// Resolves the current user from request headers
pub trait PrincipalResolver: Send + Sync {
    fn resolve(&self, headers: &HeaderMap) -> Option<UserId>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderPrincipalResolver;

impl PrincipalResolver for HeaderPrincipalResolver {
    fn resolve(&self, headers: &HeaderMap) -> Option<UserId> {
        headers
            .get(USER_HEADER)?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()
            .map(UserId)
    }
}

/// Extractor for the authenticated user; rejects with 401
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal(pub UserId);

#[async_trait]
impl FromRequestParts<AppState> for Principal {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        state
            .principals
            .resolve(&parts.headers)
            .map(Principal)
            .ok_or(ApiError::Wallet(WalletError::Unauthorized))
    }
}
