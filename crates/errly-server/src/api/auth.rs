//! Session-cookie authentication and secret comparison.
//!
//! The dashboard cookie holds an opaque token whose SHA-256 is the session
//! id; the raw token is never stored. Secrets are compared by hashing both
//! sides first and comparing the digests in constant time, which also
//! removes the length-mismatch hazard of naive constant-time compares.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use http::header::COOKIE;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::ApiError;
use crate::AppState;

/// Name of the dashboard session cookie.
pub const SESSION_COOKIE: &str = "errly_session";

/// Extract the session token from the Cookie header.
#[must_use]
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    for value in headers.get_all(COOKIE) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            if let Some((name, token)) = pair.trim().split_once('=') {
                if name == SESSION_COOKIE && !token.is_empty() {
                    return Some(token.to_owned());
                }
            }
        }
    }
    None
}

/// Validate the request's session cookie; returns the session hash.
pub async fn validate_session(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let token = session_token(headers).ok_or(ApiError::Unauthorized)?;
    let hash = errly_store::hash_token(&token);

    let session = state
        .store
        .get_session(&hash)
        .await
        .map_err(ApiError::from)?
        .ok_or(ApiError::Unauthorized)?;

    if session.is_expired(chrono::Utc::now().timestamp_millis()) {
        return Err(ApiError::Unauthorized);
    }
    Ok(hash)
}

/// Extractor guarding the dashboard-facing routes.
///
/// Handlers that take this argument reject unauthenticated requests with
/// 401 before running; the wrapped value is the session hash.
pub struct RequireSession(pub String);

impl std::fmt::Debug for RequireSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RequireSession")
    }
}

impl FromRequestParts<AppState> for RequireSession {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        validate_session(state, &parts.headers).await.map(Self)
    }
}

/// Constant-time secret comparison over SHA-256 digests.
#[must_use]
pub fn secrets_match(provided: &str, expected: &str) -> bool {
    let provided = Sha256::digest(provided.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    provided.as_slice().ct_eq(expected.as_slice()).into()
}
