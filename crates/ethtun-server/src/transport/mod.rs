//! Network transports that carry tunnels.

pub mod websocket;

pub use websocket::{start_listener, AcceptedTunnel, Listener};
