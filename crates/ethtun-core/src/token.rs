//! HMAC-signed session cookies.
//!
//! Format: `base64url(payload-json) "." base64url(HMAC-SHA256(payload-b64, secret))`
//! where the payload is `{"v":1,"sid":"...","exp":<unix secs>}`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::hmac;
use serde::{Deserialize, Serialize};

use crate::error::TokenError;

/// Only payload version understood by this crate.
pub const SESSION_COOKIE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub v: u32,
    pub sid: String,
    pub exp: u64,
}

/// Seconds since the Unix epoch. A clock set before 1970 reads as zero.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) fn sign_b64(secret: &[u8], data: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    URL_SAFE_NO_PAD.encode(hmac::sign(&key, data).as_ref())
}

pub(crate) fn verify_b64(secret: &[u8], data: &[u8], signature_b64: &str) -> Result<(), TokenError> {
    let signature = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| TokenError::Malformed("signature is not base64url"))?;
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::verify(&key, data, &signature).map_err(|_| TokenError::BadSignature)
}

/// Mint a cookie value for `sid` that expires at `exp` (unix seconds).
pub fn mint_session_cookie(secret: &[u8], sid: &str, exp: u64) -> Result<String, TokenError> {
    let claims = SessionClaims {
        v: SESSION_COOKIE_VERSION,
        sid: sid.to_string(),
        exp,
    };
    let json = serde_json::to_vec(&claims).map_err(|e| TokenError::Encode(e.to_string()))?;
    let payload = URL_SAFE_NO_PAD.encode(json);
    let signature = sign_b64(secret, payload.as_bytes());
    Ok(format!("{payload}.{signature}"))
}

/// Split a raw cookie value on its last `.` into payload and signature.
pub fn split_session_cookie(raw: &str) -> Option<(&str, &str)> {
    let (payload, signature) = raw.rsplit_once('.')?;
    if payload.is_empty() || signature.is_empty() {
        return None;
    }
    Some((payload, signature))
}

/// Verify an already split cookie.
///
/// The signature is checked before the payload is parsed, so unsigned input
/// never reaches the JSON decoder.
pub fn verify_session_parts(
    payload: &str,
    signature: &str,
    secret: &[u8],
    now: u64,
) -> Result<SessionClaims, TokenError> {
    verify_b64(secret, payload.as_bytes(), signature)?;

    let json = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| TokenError::Malformed("payload is not base64url"))?;
    let claims: SessionClaims =
        serde_json::from_slice(&json).map_err(|_| TokenError::Malformed("payload is not a session object"))?;

    if claims.v != SESSION_COOKIE_VERSION {
        return Err(TokenError::ClaimMismatch("v"));
    }
    if claims.sid.is_empty() {
        return Err(TokenError::Malformed("empty sid"));
    }
    if claims.exp <= now {
        return Err(TokenError::Expired);
    }
    Ok(claims)
}

/// Verify a raw cookie value as it appears after `ethtun_session=`.
pub fn verify_session_cookie(raw: &str, secret: &[u8], now: u64) -> Result<SessionClaims, TokenError> {
    let (payload, signature) =
        split_session_cookie(raw).ok_or(TokenError::Malformed("missing signature separator"))?;
    verify_session_parts(payload, signature, secret, now)
}
