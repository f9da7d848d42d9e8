//! Caller identity.
//!
//! Sign-in happens upstream. Requests reach this service through an identity
//! proxy that has already validated the session and injects the member id.

use std::sync::Arc;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use giftfund_core::DomainError;

use crate::errors::AppError;
use crate::AppState;

pub const MEMBER_HEADER: &str = "x-member-id";

/// Resolves request credentials to a member id.
pub trait IdentityProvider: Send + Sync {
    fn resolve(&self, headers: &HeaderMap) -> Result<i64, DomainError>;
}

/// Trusts the `X-Member-Id` header set by the identity proxy, provided the
/// request still carries a bearer token.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrustedProxyIdentity;

impl IdentityProvider for TrustedProxyIdentity {
    fn resolve(&self, headers: &HeaderMap) -> Result<i64, DomainError> {
        let token = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .unwrap_or_default();
        if token.is_empty() {
            return Err(DomainError::AuthRequired);
        }

        headers
            .get(MEMBER_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|id| *id > 0)
            .ok_or(DomainError::AuthRequired)
    }
}

/// The authenticated caller of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthMember(pub i64);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthMember {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let member_id = state.identity.resolve(&parts.headers)?;
        Ok(AuthMember(member_id))
    }
}
