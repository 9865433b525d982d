//! ethtun-core: shared protocol library for the ethtun L2 tunnel.
//!
//! Provides the wire codec, control sideband messages, session cookies,
//! HS256 bearer tokens, and the error taxonomy shared by gateway and clients.

pub mod codec;
pub mod control;
pub mod error;
pub mod jwt;
pub mod token;

/// WebSocket sub-protocol every tunnel must offer.
pub const TUNNEL_SUBPROTOCOL: &str = "ethtun-l2-v1";
/// Prefix of the optional sub-protocol entry that carries a credential.
pub const TOKEN_SUBPROTOCOL_PREFIX: &str = "ethtun-token.";
/// Cookie carrying the signed session.
pub const SESSION_COOKIE_NAME: &str = "ethtun_session";

// Re-export commonly used items at crate root.
pub use codec::{decode, encode, FrameKind, ProtocolViolation, WireMessage};
pub use control::ControlMessage;
pub use error::{TokenError, TunnelError, TunnelResult};
pub use jwt::{mint_jwt_hs256, verify_jwt_hs256, JwtClaims, JwtValidation};
pub use token::{mint_session_cookie, unix_now, verify_session_cookie, SessionClaims};
