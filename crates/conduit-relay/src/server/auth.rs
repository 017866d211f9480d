//! Token extraction for agent and operator requests.

use axum::http::HeaderMap;
use axum::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use subtle::ConstantTimeEq;

use super::error::ApiError;

/// Subprotocol browsers use to carry a token on WebSocket upgrades.
pub const TOKEN_SUBPROTOCOL: &str = "jwt";

/// Token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Token from a `Sec-WebSocket-Protocol: jwt, <token>` header.
pub fn subprotocol_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(SEC_WEBSOCKET_PROTOCOL)?.to_str().ok()?;
    let mut parts = value.split(',').map(str::trim);
    if parts.next()? != TOKEN_SUBPROTOCOL {
        return None;
    }
    parts.next().filter(|t| !t.is_empty())
}

/// Check the operator token, accepted from either header.
pub fn require_operator(headers: &HeaderMap, expected: &str) -> Result<(), ApiError> {
    let token = bearer_token(headers)
        .or_else(|| subprotocol_token(headers))
        .ok_or_else(|| ApiError::Unauthorized("authorization required".into()))?;
    if tokens_match(token, expected) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized("invalid token".into()))
    }
}

/// Compare without short-circuiting on the first differing byte.
fn tokens_match(given: &str, expected: &str) -> bool {
    given.as_bytes().ct_eq(expected.as_bytes()).into()
}
