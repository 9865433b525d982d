//! ethtun-server: L2-over-WebSocket tunnel gateway.

use std::path::PathBuf;

use clap::Parser;
use ethtun_server::config::{CliOverrides, ServerConfig, DEFAULT_CONFIG_PATH};
use ethtun_server::{relay_for, start_server};
use tracing::{error, info};

/// ethtun-server: L2 tunnel gateway
#[derive(Parser, Debug)]
#[command(name = "ethtun-server", version, about = "L2-over-WebSocket tunnel gateway")]
struct Cli {
    /// Listen address (overrides ETHTUN_LISTEN_ADDR)
    #[arg(short, long)]
    listen: Option<String>,

    /// Config file path
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Skip Origin enforcement (authentication still applies)
    #[arg(long)]
    open: bool,

    /// Comma-separated allowed origins, or `*`
    #[arg(long)]
    allowed_origins: Option<String>,

    /// Comma-separated allowed Host values (checked even with --open)
    #[arg(long)]
    allowed_hosts: Option<String>,

    /// Authentication scheme: none, token, session, jwt
    #[arg(long)]
    auth_mode: Option<String>,

    /// Maximum concurrent tunnels (0 = unbounded)
    #[arg(long)]
    max_connections: Option<u64>,

    /// Maximum concurrent tunnels per client IP (0 = unbounded)
    #[arg(long)]
    max_connections_per_ip: Option<u64>,

    /// Maximum concurrent tunnels per session (0 = unbounded)
    #[arg(long)]
    max_tunnels_per_session: Option<u64>,

    /// Byte quota per tunnel, both directions combined (0 = unbounded)
    #[arg(long)]
    max_bytes_per_connection: Option<u64>,

    /// Inbound messages per second per tunnel (0 = unbounded)
    #[arg(long)]
    max_frames_per_second: Option<u64>,

    /// Keepalive ping interval in milliseconds (0 = disabled)
    #[arg(long)]
    ping_interval_ms: Option<u64>,

    /// Relay: `loopback` or `udp:<host:port>`
    #[arg(long)]
    relay: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            listen_addr: self.listen.clone(),
            open_mode: self.open,
            allowed_origins: self.allowed_origins.clone(),
            allowed_hosts: self.allowed_hosts.clone(),
            auth_mode: self.auth_mode.clone(),
            max_connections: self.max_connections,
            max_connections_per_ip: self.max_connections_per_ip,
            max_tunnels_per_session: self.max_tunnels_per_session,
            max_bytes_per_connection: self.max_bytes_per_connection,
            max_frames_per_second: self.max_frames_per_second,
            ping_interval_ms: self.ping_interval_ms,
            relay: self.relay.clone(),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting ethtun-server");

    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), &cli.overrides()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let relay = relay_for(&server_config.relay);
    info!(relay = ?server_config.relay, "relay selected");

    let server = match start_server(server_config, relay).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };

    shutdown_signal().await;
    info!("received shutdown signal");
    server.shutdown().await;

    info!("ethtun-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
