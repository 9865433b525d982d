//! Compact HS256 JSON Web Tokens.
//!
//! Only what the gateway needs: a fixed `HS256` header, `exp`/`nbf` timing,
//! and optional audience and issuer pinning.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::TokenError;
use crate::token::{sign_b64, verify_b64};

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typ: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Session id; absent means the bearer is authenticated but anonymous.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// Claim values a token must carry, when configured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JwtValidation {
    pub audience: Option<String>,
    pub issuer: Option<String>,
}

pub fn mint_jwt_hs256(claims: &JwtClaims, secret: &[u8]) -> Result<String, TokenError> {
    let header = Header {
        alg: "HS256".into(),
        typ: Some("JWT".into()),
    };
    let header = serde_json::to_vec(&header).map_err(|e| TokenError::Encode(e.to_string()))?;
    let body = serde_json::to_vec(claims).map_err(|e| TokenError::Encode(e.to_string()))?;

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header),
        URL_SAFE_NO_PAD.encode(body)
    );
    let signature = sign_b64(secret, signing_input.as_bytes());
    Ok(format!("{signing_input}.{signature}"))
}

pub fn verify_jwt_hs256(
    token: &str,
    secret: &[u8],
    validation: &JwtValidation,
    now: u64,
) -> Result<JwtClaims, TokenError> {
    let mut parts = token.split('.');
    let (Some(header_b64), Some(claims_b64), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(TokenError::Malformed("expected three segments"));
    };

    let signing_input_len = header_b64.len() + 1 + claims_b64.len();
    verify_b64(secret, token[..signing_input_len].as_bytes(), signature)?;

    let header: Header = decode_segment(header_b64, "header is not JSON")?;
    if header.alg != "HS256" {
        return Err(TokenError::ClaimMismatch("alg"));
    }

    let claims: JwtClaims = decode_segment(claims_b64, "claims are not JSON")?;
    if claims.exp <= now {
        return Err(TokenError::Expired);
    }
    if claims.nbf.is_some_and(|nbf| nbf > now) {
        return Err(TokenError::NotYetValid);
    }
    if let Some(expected) = validation.audience.as_deref() {
        if claims.aud.as_deref() != Some(expected) {
            return Err(TokenError::ClaimMismatch("aud"));
        }
    }
    if let Some(expected) = validation.issuer.as_deref() {
        if claims.iss.as_deref() != Some(expected) {
            return Err(TokenError::ClaimMismatch("iss"));
        }
    }
    if claims.sid.as_deref() == Some("") {
        return Err(TokenError::Malformed("empty sid"));
    }
    Ok(claims)
}

fn decode_segment<T: for<'de> Deserialize<'de>>(
    segment: &str,
    what: &'static str,
) -> Result<T, TokenError> {
    let raw = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| TokenError::Malformed("segment is not base64url"))?;
    serde_json::from_slice(&raw).map_err(|_| TokenError::Malformed(what))
}
