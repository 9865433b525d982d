//! Hand-off between tunnels and the network stack behind the gateway.
//!
//! The gateway does not interpret Ethernet frames. Each admitted tunnel is
//! attached to a [`Relay`], which returns a pair of channels: frames the
//! guest sent go out on `to_network`, frames for the guest come back on
//! `from_network`.

use std::net::SocketAddr;

use ethtun_core::codec::MAX_DATA_PAYLOAD;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};

use crate::auth::SessionIdentity;

/// Frames buffered in each direction before a relay starts dropping.
pub const RELAY_CHANNEL_CAPACITY: usize = 256;

/// Channel pair connecting one tunnel to the network stack.
#[derive(Debug)]
pub struct RelayLink {
    pub to_network: mpsc::Sender<Vec<u8>>,
    pub from_network: mpsc::Receiver<Vec<u8>>,
}

pub trait Relay: Send + Sync {
    /// Attach a newly admitted tunnel.
    ///
    /// The link lives until the tunnel drops it; relays should release any
    /// per-tunnel resources once `to_network` closes.
    fn attach(&self, tunnel_id: u64, identity: Option<&SessionIdentity>) -> RelayLink;
}

/// Sends every frame straight back to the guest that sent it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackRelay;

impl Relay for LoopbackRelay {
    fn attach(&self, tunnel_id: u64, _identity: Option<&SessionIdentity>) -> RelayLink {
        trace!(tunnel_id, "attaching loopback relay");
        let (tx, rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
        RelayLink {
            to_network: tx,
            from_network: rx,
        }
    }
}

/// Bridges each tunnel to a downstream stack over UDP.
///
/// Every tunnel gets its own ephemeral socket connected to `target`; each
/// Ethernet frame travels as one datagram in either direction.
#[derive(Debug, Clone)]
pub struct UdpBridgeRelay {
    target: SocketAddr,
}

impl UdpBridgeRelay {
    pub fn new(target: SocketAddr) -> Self {
        Self { target }
    }
}

impl Relay for UdpBridgeRelay {
    fn attach(&self, tunnel_id: u64, identity: Option<&SessionIdentity>) -> RelayLink {
        let (to_network, outbound) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
        let (inbound, from_network) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
        let target = self.target;
        let session_id = identity.map(|i| i.session_id.clone());

        tokio::spawn(async move {
            if let Err(e) = run_udp_bridge(target, outbound, inbound).await {
                warn!(tunnel_id, session_id = session_id.as_deref(), %target, error = %e, "udp bridge failed");
            }
            debug!(tunnel_id, "udp bridge stopped");
        });

        RelayLink {
            to_network,
            from_network,
        }
    }
}

async fn run_udp_bridge(
    target: SocketAddr,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    inbound: mpsc::Sender<Vec<u8>>,
) -> std::io::Result<()> {
    let bind: SocketAddr = if target.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(target).await?;

    // One byte of slack so oversized datagrams are detectable.
    let mut buf = vec![0u8; MAX_DATA_PAYLOAD + 1];
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    return Ok(());
                };
                // A connected socket reports an earlier ICMP unreachable on the
                // next call. The stack may just be restarting, so keep going.
                if let Err(e) = socket.send(&frame).await {
                    debug!(%target, error = %e, "udp send failed, dropping frame");
                }
            }
            received = socket.recv(&mut buf) => {
                let n = match received {
                    Ok(n) => n,
                    Err(e) => {
                        debug!(%target, error = %e, "udp recv failed");
                        continue;
                    }
                };
                if n > MAX_DATA_PAYLOAD {
                    debug!(len = n, "dropping oversized datagram from network");
                    continue;
                }
                match inbound.try_send(buf[..n].to_vec()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => trace!("tunnel not keeping up, dropping frame from network"),
                    Err(TrySendError::Closed(_)) => return Ok(()),
                }
            }
        }
    }
}
