//! WebSocket listener using tokio-tungstenite.
//!
//! Every accepted TCP connection runs the WebSocket handshake with the
//! [`Gatekeeper`] in the header callback, so refused peers get their HTTP
//! status before any tunnel state exists. Admitted connections are handed
//! to the server over a channel.

use std::net::SocketAddr;
use std::sync::Arc;

use ethtun_core::codec::MAX_WIRE_MESSAGE;
use ethtun_core::{TunnelError, TunnelResult, TUNNEL_SUBPROTOCOL};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info};

use crate::upgrade::{Admission, Gatekeeper, UpgradeRequest};

/// A WebSocket that passed admission.
#[derive(Debug)]
pub struct AcceptedTunnel {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
    pub admission: Admission,
}

/// A bound listener and the task accepting on it.
#[derive(Debug)]
pub struct Listener {
    pub local_addr: SocketAddr,
    pub accepted: mpsc::Receiver<AcceptedTunnel>,
    pub accept_task: JoinHandle<()>,
}

/// Limits applied to every tunnel socket: one wire message per WebSocket
/// message, so nothing larger than the biggest wire message is accepted.
pub fn tunnel_ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_WIRE_MESSAGE);
    config.max_frame_size = Some(MAX_WIRE_MESSAGE);
    config
}

/// Bind `bind_addr` and start accepting tunnels.
pub async fn start_listener(bind_addr: SocketAddr, gatekeeper: Arc<Gatekeeper>) -> TunnelResult<Listener> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| TunnelError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<AcceptedTunnel>(64);

    let accept_task = tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let gatekeeper = gatekeeper.clone();
                    tokio::spawn(async move {
                        let Some(tunnel) = handshake(stream, addr, &gatekeeper).await else {
                            return;
                        };
                        if tx.send(tunnel).await.is_err() {
                            debug!(remote = %addr, "server stopped, dropping accepted tunnel");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok(Listener {
        local_addr,
        accepted: rx,
        accept_task,
    })
}

async fn handshake(stream: TcpStream, addr: SocketAddr, gatekeeper: &Gatekeeper) -> Option<AcceptedTunnel> {
    let _ = stream.set_nodelay(true);

    let mut admitted: Option<Admission> = None;
    let callback = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
        let upgrade = UpgradeRequest::from_http(req, Some(addr));
        let admission = gatekeeper.admit(&upgrade).map_err(|r| r.into_response())?;
        resp.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(TUNNEL_SUBPROTOCOL),
        );
        admitted = Some(admission);
        Ok(resp)
    };

    match tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(tunnel_ws_config())).await {
        Ok(ws_stream) => {
            let admission = admitted?;
            debug!(remote = %addr, tunnel_id = admission.tunnel_id, "WebSocket connection accepted");
            Some(AcceptedTunnel {
                ws_stream,
                remote_addr: addr,
                admission,
            })
        }
        Err(e) => {
            // Rejections end up here too; the gatekeeper already logged them.
            debug!(remote = %addr, error = %e, "WebSocket handshake failed");
            None
        }
    }
}
