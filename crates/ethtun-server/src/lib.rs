//! ethtun-server: WebSocket gateway for L2 tunnels.
//!
//! Admits tunnels at upgrade time (path and sub-protocol, credentials,
//! origin, admission caps), then runs one task per tunnel that enforces
//! byte and frame-rate quotas while relaying Ethernet frames.

pub mod admission;
pub mod auth;
pub mod config;
pub mod origin;
pub mod quota;
pub mod relay;
pub mod server;
pub mod transport;
pub mod tunnel;
pub mod upgrade;

pub use config::ServerConfig;
pub use relay::{LoopbackRelay, Relay, RelayLink, UdpBridgeRelay};
pub use server::{relay_for, start_server, ServerHandle};
