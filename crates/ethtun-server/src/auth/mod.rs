//! Upgrade-time authentication.
//!
//! One scheme is active per process. [`AuthResolver::resolve`] finds the
//! credential(s) the request carries for that scheme and verifies them.

pub mod credential;

use std::fmt;
use std::str::FromStr;

use ethtun_core::jwt::{verify_jwt_hs256, JwtValidation};
use ethtun_core::token::verify_session_parts;
use ethtun_core::TokenError;
use subtle::ConstantTimeEq;
use tracing::trace;

pub use credential::Credential;

use crate::upgrade::UpgradeRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    None,
    Token,
    Session,
    Jwt,
}

impl AuthMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthMode::None => "none",
            AuthMode::Token => "token",
            AuthMode::Session => "session",
            AuthMode::Jwt => "jwt",
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(AuthMode::None),
            "token" | "api_key" => Ok(AuthMode::Token),
            "session" | "cookie" => Ok(AuthMode::Session),
            "jwt" => Ok(AuthMode::Jwt),
            other => Err(format!("unknown auth mode: {other:?}")),
        }
    }
}

/// The active scheme together with its secret material.
#[derive(Clone)]
pub enum AuthScheme {
    None,
    Token { secret: String },
    Session { secret: Vec<u8> },
    Jwt { secret: Vec<u8>, validation: JwtValidation },
}

impl AuthScheme {
    pub fn mode(&self) -> AuthMode {
        match self {
            AuthScheme::None => AuthMode::None,
            AuthScheme::Token { .. } => AuthMode::Token,
            AuthScheme::Session { .. } => AuthMode::Session,
            AuthScheme::Jwt { .. } => AuthMode::Jwt,
        }
    }
}

// Secrets stay out of logs.
impl fmt::Debug for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthScheme::{}", self.mode())
    }
}

/// An authenticated session, as named by a cookie or JWT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub session_id: String,
    pub expires_at_unix_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    /// `None` for anonymous schemes and JWTs without a `sid`.
    pub identity: Option<SessionIdentity>,
}

impl AuthOutcome {
    fn anonymous() -> Self {
        Self { identity: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing credentials")]
    Missing,
    #[error("invalid credentials")]
    Invalid,
    #[error("expired credentials")]
    Expired,
}

impl From<TokenError> for AuthError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired => AuthError::Expired,
            _ => AuthError::Invalid,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthResolver {
    scheme: AuthScheme,
}

impl AuthResolver {
    pub fn new(scheme: AuthScheme) -> Self {
        Self { scheme }
    }

    pub fn mode(&self) -> AuthMode {
        self.scheme.mode()
    }

    /// Authenticate `req` at unix time `now`.
    ///
    /// Candidates are tried in priority order and the first valid one wins.
    /// When none verifies, the error of the highest-priority candidate is
    /// returned.
    pub fn resolve(&self, req: &UpgradeRequest, now: u64) -> Result<AuthOutcome, AuthError> {
        if let AuthScheme::None = self.scheme {
            return Ok(AuthOutcome::anonymous());
        }

        let candidates = credential::candidates(self.mode(), req);
        let mut first_error = None;
        for candidate in &candidates {
            match self.verify(candidate, now) {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    trace!(error = %err, "credential candidate rejected");
                    first_error.get_or_insert(err);
                }
            }
        }
        Err(first_error.unwrap_or(AuthError::Missing))
    }

    fn verify(&self, credential: &Credential, now: u64) -> Result<AuthOutcome, AuthError> {
        match (&self.scheme, credential) {
            (AuthScheme::Token { secret }, Credential::Token(supplied) | Credential::ApiKey(supplied)) => {
                if secret.is_empty() {
                    return Err(AuthError::Invalid);
                }
                if bool::from(secret.as_bytes().ct_eq(supplied.as_bytes())) {
                    Ok(AuthOutcome::anonymous())
                } else {
                    Err(AuthError::Invalid)
                }
            }
            (AuthScheme::Session { secret }, Credential::SessionCookie { payload, signature }) => {
                let claims = verify_session_parts(payload, signature, secret, now)?;
                Ok(AuthOutcome {
                    identity: Some(SessionIdentity {
                        session_id: claims.sid,
                        expires_at_unix_secs: claims.exp,
                    }),
                })
            }
            (AuthScheme::Jwt { secret, validation }, Credential::BearerJwt(token)) => {
                let claims = verify_jwt_hs256(token, secret, validation, now)?;
                Ok(AuthOutcome {
                    identity: claims.sid.map(|session_id| SessionIdentity {
                        session_id,
                        expires_at_unix_secs: claims.exp,
                    }),
                })
            }
            _ => Err(AuthError::Missing),
        }
    }
}
