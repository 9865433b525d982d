//! Server lifecycle: listener, tunnel tasks, graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ethtun_core::TunnelResult;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::admission::AdmissionController;
use crate::auth::AuthResolver;
use crate::config::{RelayTarget, ServerConfig};
use crate::origin::OriginPolicy;
use crate::relay::{LoopbackRelay, Relay, UdpBridgeRelay};
use crate::transport::{start_listener, AcceptedTunnel};
use crate::tunnel::{run_tunnel, ConnectionState, TunnelSettings};
use crate::upgrade::Gatekeeper;

/// Build the relay named by the configuration.
pub fn relay_for(target: &RelayTarget) -> Arc<dyn Relay> {
    match target {
        RelayTarget::Loopback => Arc::new(LoopbackRelay),
        RelayTarget::Udp(addr) => Arc::new(UdpBridgeRelay::new(*addr)),
    }
}

/// A running gateway.
pub struct ServerHandle {
    local_addr: SocketAddr,
    gatekeeper: Arc<Gatekeeper>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_grace: Duration,
    accept_task: JoinHandle<()>,
    dispatch_task: Mutex<Option<JoinHandle<JoinSet<()>>>>,
}

impl ServerHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn admission(&self) -> &AdmissionController {
        self.gatekeeper.admission()
    }

    /// Stop accepting, close live tunnels with 1001, and wait for them.
    ///
    /// Tunnels still running after the grace period are aborted.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.gatekeeper.begin_shutdown();
        let _ = self.shutdown_tx.send(());

        let Some(dispatch) = self.dispatch_task.lock().await.take() else {
            return;
        };
        let mut tunnels = match dispatch.await {
            Ok(tunnels) => tunnels,
            Err(e) => {
                warn!(error = %e, "tunnel dispatcher failed");
                return;
            }
        };
        self.accept_task.abort();

        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while tunnels.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tunnels.len(), "aborting tunnels after shutdown grace period");
            tunnels.shutdown().await;
        }
        info!("shutdown complete");
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.accept_task.abort();
        if let Some(dispatch) = self.dispatch_task.get_mut().take() {
            dispatch.abort();
        }
    }
}

/// Bind the listener and start serving tunnels.
pub async fn start_server(config: ServerConfig, relay: Arc<dyn Relay>) -> TunnelResult<ServerHandle> {
    let gatekeeper = Gatekeeper::new(
        AuthResolver::new(config.auth.clone()),
        OriginPolicy::new(config.allowed_origins.clone()),
        config.allowed_hosts.clone(),
        config.open_mode,
        AdmissionController::new(config.admission),
    );

    let listener = start_listener(config.listen_addr, gatekeeper.clone()).await?;
    let (shutdown_tx, _) = broadcast::channel(1);

    let settings = TunnelSettings {
        ping_interval: config.ping_interval,
        ..TunnelSettings::default()
    };

    info!(
        addr = %listener.local_addr,
        auth_mode = %config.auth.mode(),
        open_mode = config.open_mode,
        max_connections = config.admission.max_connections,
        max_connections_per_ip = config.admission.max_connections_per_ip,
        host_check = config.allowed_hosts.is_enforced(),
        max_tunnels_per_session = config.admission.max_tunnels_per_session,
        max_bytes_per_connection = config.quota.max_bytes_per_connection,
        max_frames_per_second = config.quota.max_frames_per_second,
        "ethtun-server ready"
    );

    let shutdown_grace = config.shutdown_grace;
    let dispatch_task = tokio::spawn(dispatch(
        listener.accepted,
        gatekeeper.clone(),
        relay,
        config,
        settings,
        shutdown_tx.clone(),
    ));

    Ok(ServerHandle {
        local_addr: listener.local_addr,
        gatekeeper,
        shutdown_tx,
        shutdown_grace,
        accept_task: listener.accept_task,
        dispatch_task: Mutex::new(Some(dispatch_task)),
    })
}

/// Spawn a tunnel task for every accepted connection until shutdown.
///
/// Returns the set of tunnel tasks still running so shutdown can wait on them.
async fn dispatch(
    mut accepted: mpsc::Receiver<AcceptedTunnel>,
    gatekeeper: Arc<Gatekeeper>,
    relay: Arc<dyn Relay>,
    config: ServerConfig,
    settings: TunnelSettings,
    shutdown_tx: broadcast::Sender<()>,
) -> JoinSet<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut tunnels = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,

            Some(joined) = tunnels.join_next(), if !tunnels.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "tunnel task failed");
                }
            }

            next = accepted.recv() => {
                let Some(tunnel) = next else {
                    debug!("listener closed");
                    break;
                };
                let AcceptedTunnel { ws_stream, remote_addr, admission } = tunnel;

                let tunnel_shutdown = shutdown_tx.subscribe();
                if gatekeeper.is_shutting_down() {
                    // Subscribed after the broadcast went out; repeat it.
                    let _ = shutdown_tx.send(());
                }

                let tunnel_id = admission.tunnel_id;
                let span = info_span!(
                    "tunnel",
                    tunnel_id,
                    session_id = admission.identity.as_ref().map(|i| i.session_id.as_str()),
                    remote = %remote_addr
                );
                let link = relay.attach(tunnel_id, admission.identity.as_ref());
                let state = ConnectionState::new(admission, config.quota);
                tunnels.spawn(
                    async move {
                        run_tunnel(ws_stream, state, link, settings, tunnel_shutdown).await;
                    }
                    .instrument(span),
                );
            }
        }
    }

    tunnels
}
