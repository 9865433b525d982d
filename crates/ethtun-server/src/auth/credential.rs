//! Locating the credential a request carries for the active scheme.

use ethtun_core::token::split_session_cookie;
use ethtun_core::SESSION_COOKIE_NAME;
use tokio_tungstenite::tungstenite::http::header;

use super::AuthMode;
use crate::upgrade::UpgradeRequest;

/// A credential as found on the request, before verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Token(String),
    ApiKey(String),
    SessionCookie { payload: String, signature: String },
    BearerJwt(String),
}

/// Every credential the request offers for `mode`, highest priority first.
///
/// An empty list means the caller supplied nothing usable.
pub fn candidates(mode: AuthMode, req: &UpgradeRequest) -> Vec<Credential> {
    match mode {
        AuthMode::None => Vec::new(),
        AuthMode::Token => {
            let mut found = Vec::new();
            if let Some(token) = non_empty(req.query_param("token")) {
                found.push(Credential::Token(token.to_string()));
            }
            if let Some(key) = non_empty(req.query_param("apiKey")) {
                found.push(Credential::ApiKey(key.to_string()));
            }
            if let Some(token) = non_empty(req.subprotocol_token()) {
                found.push(Credential::Token(token.to_string()));
            }
            found
        }
        AuthMode::Session => session_cookie(req).into_iter().collect(),
        AuthMode::Jwt => {
            let mut found = Vec::new();
            if let Some(jwt) = bearer_token(req) {
                found.push(Credential::BearerJwt(jwt.to_string()));
            }
            if let Some(jwt) = non_empty(req.query_param("token")) {
                found.push(Credential::BearerJwt(jwt.to_string()));
            }
            if let Some(jwt) = non_empty(req.subprotocol_token()) {
                found.push(Credential::BearerJwt(jwt.to_string()));
            }
            found
        }
    }
}

fn session_cookie(req: &UpgradeRequest) -> Option<Credential> {
    let raw = non_empty(req.cookie(SESSION_COOKIE_NAME))?;
    // A value without a separator is still a credential, just a bad one.
    let (payload, signature) = split_session_cookie(raw).unwrap_or((raw, ""));
    Some(Credential::SessionCookie {
        payload: payload.to_string(),
        signature: signature.to_string(),
    })
}

/// `Authorization: Bearer <token>`, scheme matched case-insensitively.
pub fn bearer_token(req: &UpgradeRequest) -> Option<&str> {
    let value = req.headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let mut parts = value.split_whitespace();
    let scheme = parts.next()?;
    let token = parts.next()?;
    if parts.next().is_some() || !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}
