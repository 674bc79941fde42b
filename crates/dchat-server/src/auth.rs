//! Bearer token verification
//!
//! Tokens are `v1.<user_id>.<expires_unix>.<hex mac>`, where the MAC is
//! HMAC-SHA256 over everything before the last dot. They are minted by the
//! operator (`dchat-server --issue-token <user>`) or by an upstream login
//! service sharing the secret.

use axum::http::{header, HeaderMap};
use chrono::Utc;
use dchat_realtime::UserId;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_VERSION: &str = "v1";

/// Authentication-related errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing bearer token")]
    Missing,

    #[error("Malformed token: {0}")]
    Malformed(&'static str),

    #[error("Token signature mismatch")]
    BadSignature,

    #[error("Token expired")]
    Expired,

    #[error("Invalid signing key")]
    InvalidKey,
}

/// Issues and verifies signed user tokens.
#[derive(Clone)]
pub struct TokenVerifier {
    key: Vec<u8>,
}

impl TokenVerifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            key: secret.as_ref().to_vec(),
        }
    }

    /// Mint a token for `user` valid for `ttl` from now.
    pub fn issue(&self, user: UserId, ttl: std::time::Duration) -> Result<String, AuthError> {
        let ttl = i64::try_from(ttl.as_secs())
            .map_err(|_| AuthError::Malformed("ttl out of range"))?;
        self.issue_until(user, Utc::now().timestamp().saturating_add(ttl))
    }

    /// Mint a token for `user` that expires at `expires_unix`.
    pub fn issue_until(&self, user: UserId, expires_unix: i64) -> Result<String, AuthError> {
        if user.is_unset() {
            return Err(AuthError::Malformed("user id must be non-zero"));
        }
        let payload = format!("{TOKEN_VERSION}.{user}.{expires_unix}");
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        Ok(format!("{payload}.{}", hex::encode(mac.finalize().into_bytes())))
    }

    /// Check `token` and return the user it was issued for.
    pub fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        self.verify_at(token, Utc::now().timestamp())
    }

    fn verify_at(&self, token: &str, now_unix: i64) -> Result<UserId, AuthError> {
        let (payload, signature) = token
            .rsplit_once('.')
            .ok_or(AuthError::Malformed("missing signature"))?;
        let signature =
            hex::decode(signature).map_err(|_| AuthError::Malformed("signature is not hex"))?;

        // Signature first, so nothing unauthenticated is interpreted
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature).map_err(|_| AuthError::BadSignature)?;

        let mut parts = payload.split('.');
        if parts.next() != Some(TOKEN_VERSION) {
            return Err(AuthError::Malformed("unknown token version"));
        }
        let user: UserId = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or(AuthError::Malformed("invalid user id"))?;
        let expires: i64 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or(AuthError::Malformed("invalid expiry"))?;
        if parts.next().is_some() {
            return Err(AuthError::Malformed("trailing fields"));
        }
        if user.is_unset() {
            return Err(AuthError::Malformed("user id must be non-zero"));
        }
        if expires <= now_unix {
            return Err(AuthError::Expired);
        }
        Ok(user)
    }

    fn mac(&self) -> Result<HmacSha256, AuthError> {
        HmacSha256::new_from_slice(&self.key).map_err(|_| AuthError::InvalidKey)
    }
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier").finish_non_exhaustive()
    }
}

/// Token from the `token` query parameter, else from `Authorization: Bearer`.
pub fn request_token(query: Option<&str>, headers: &HeaderMap) -> Result<String, AuthError> {
    if let Some(token) = query.filter(|t| !t.is_empty()) {
        return Ok(token.to_string());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::Missing)
}
