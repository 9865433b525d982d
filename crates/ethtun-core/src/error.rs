use thiserror::Error;

use crate::codec::ProtocolViolation;

/// Errors produced by the ethtun tunnel layer.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("malformed upgrade: {0}")]
    MalformedUpgrade(String),

    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("origin denied: {0}")]
    OriginDenied(String),

    #[error("admission denied: {0}")]
    AdmissionDenied(String),

    #[error("shutting down")]
    ShuttingDown,

    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] ProtocolViolation),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TunnelResult<T> = Result<T, TunnelError>;

/// Failure verifying a session cookie or bearer JWT.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(&'static str),

    #[error("invalid token signature")]
    BadSignature,

    #[error("token expired")]
    Expired,

    #[error("token not yet valid")]
    NotYetValid,

    #[error("claim mismatch: {0}")]
    ClaimMismatch(&'static str),

    #[error("token encoding failed: {0}")]
    Encode(String),
}
