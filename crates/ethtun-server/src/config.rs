//! Server configuration: TOML file, then environment, then CLI overrides.
//!
//! Every value is validated here, once, at startup. Nothing is re-read per
//! request.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ethtun_core::jwt::JwtValidation;
use ethtun_core::{TunnelError, TunnelResult};
use serde::Deserialize;
use tracing::info;

use crate::admission::AdmissionLimits;
use crate::auth::{AuthMode, AuthScheme};
use crate::origin::{AllowedOrigins, HostPolicy};
use crate::quota::QuotaLimits;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8090";
pub const DEFAULT_CONFIG_PATH: &str = "~/.ethtun/config.toml";

/// Allow-list variable shared with other services on the same host.
pub const FALLBACK_ORIGINS_VAR: &str = "ALLOWED_ORIGINS";

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub limits: LimitsSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    pub listen_addr: Option<String>,
    pub open_mode: Option<bool>,
    pub allowed_origins: Option<Vec<String>>,
    pub allowed_hosts: Option<Vec<String>>,
    pub ping_interval_ms: Option<u64>,
    pub relay: Option<String>,
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthSection {
    pub mode: Option<String>,
    pub token: Option<String>,
    pub api_key: Option<String>,
    pub session_secret: Option<String>,
    pub jwt_secret: Option<String>,
    pub jwt_audience: Option<String>,
    pub jwt_issuer: Option<String>,
}

/// `[limits]` section of the config TOML. Zero means unbounded.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsSection {
    pub max_connections: Option<u64>,
    pub max_connections_per_ip: Option<u64>,
    pub max_tunnels_per_session: Option<u64>,
    pub max_bytes_per_connection: Option<u64>,
    pub max_frames_per_second: Option<u64>,
}

/// Values given on the command line; each one beats file and environment.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub listen_addr: Option<String>,
    pub open_mode: bool,
    pub allowed_origins: Option<String>,
    pub allowed_hosts: Option<String>,
    pub auth_mode: Option<String>,
    pub max_connections: Option<u64>,
    pub max_connections_per_ip: Option<u64>,
    pub max_tunnels_per_session: Option<u64>,
    pub max_bytes_per_connection: Option<u64>,
    pub max_frames_per_second: Option<u64>,
    pub ping_interval_ms: Option<u64>,
    pub relay: Option<String>,
}

/// Where admitted tunnels send their frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayTarget {
    Loopback,
    Udp(SocketAddr),
}

impl std::str::FromStr for RelayTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("loopback") {
            return Ok(RelayTarget::Loopback);
        }
        if let Some(addr) = s.strip_prefix("udp:") {
            return addr
                .parse()
                .map(RelayTarget::Udp)
                .map_err(|e| format!("invalid udp relay address {addr:?}: {e}"));
        }
        Err(format!("unknown relay {s:?} (expected loopback or udp:<host:port>)"))
    }
}

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Skip `Origin` enforcement. Authentication still applies.
    pub open_mode: bool,
    pub allowed_origins: AllowedOrigins,
    /// Checked even in open mode; empty accepts any `Host`.
    pub allowed_hosts: HostPolicy,
    pub auth: AuthScheme,
    pub admission: AdmissionLimits,
    pub quota: QuotaLimits,
    /// Keepalive ping period; `None` disables keepalives.
    pub ping_interval: Option<Duration>,
    pub relay: RelayTarget,
    /// How long live tunnels get to close after shutdown starts.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
            open_mode: false,
            allowed_origins: AllowedOrigins::List(Vec::new()),
            allowed_hosts: HostPolicy::default(),
            auth: AuthScheme::None,
            admission: AdmissionLimits::default(),
            quota: QuotaLimits::default(),
            ping_interval: None,
            relay: RelayTarget::Loopback,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl ServerConfig {
    /// Load from the config file and the process environment, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: &CliOverrides) -> TunnelResult<Self> {
        Self::load_with(config_path, cli, |key| std::env::var(key).ok())
    }

    /// Same as [`load`](Self::load) with an explicit environment lookup.
    pub fn load_with(
        config_path: Option<&Path>,
        cli: &CliOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> TunnelResult<Self> {
        let file = match config_path {
            Some(path) => read_config_file(path)?,
            None => ConfigFile::default(),
        };
        resolve(file, cli, &env)
    }

    /// Resolve from environment variables only.
    pub fn from_env_lookup(env: impl Fn(&str) -> Option<String>) -> TunnelResult<Self> {
        resolve(ConfigFile::default(), &CliOverrides::default(), &env)
    }
}

fn read_config_file(path: &Path) -> TunnelResult<ConfigFile> {
    let expanded = expand_tilde(path);
    if !expanded.exists() {
        info!(path = %expanded.display(), "config file not found, using defaults");
        return Ok(ConfigFile::default());
    }
    info!(path = %expanded.display(), "loading config file");
    let content = std::fs::read_to_string(&expanded)?;
    toml::from_str(&content).map_err(|e| config_err(format!("config parse error: {e}")))
}

fn resolve(
    file: ConfigFile,
    cli: &CliOverrides,
    env: &dyn Fn(&str) -> Option<String>,
) -> TunnelResult<ServerConfig> {
    // Empty environment values count as unset.
    let var = |key: &str| env(key).filter(|v| !v.trim().is_empty());

    let listen_raw = cli
        .listen_addr
        .clone()
        .or_else(|| var("ETHTUN_LISTEN_ADDR"))
        .or(file.server.listen_addr)
        .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
    let listen_addr: SocketAddr = listen_raw
        .parse()
        .map_err(|e| config_err(format!("invalid listen address {listen_raw:?}: {e}")))?;

    let open_mode = if cli.open_mode {
        true
    } else if let Some(raw) = var("ETHTUN_OPEN_MODE") {
        parse_bool("ETHTUN_OPEN_MODE", &raw)?
    } else {
        file.server.open_mode.unwrap_or(false)
    };

    let allowed_origins = resolve_origins(cli, &var, file.server.allowed_origins)?;
    let allowed_hosts = match cli
        .allowed_hosts
        .clone()
        .or_else(|| var("ETHTUN_ALLOWED_HOSTS"))
        .or(file.server.allowed_hosts.map(|entries| entries.join(",")))
    {
        Some(raw) => HostPolicy::parse(&raw).map_err(config_err)?,
        None => HostPolicy::default(),
    };
    let auth = resolve_auth(cli, &var, file.auth)?;

    let limits = file.limits;
    let admission = AdmissionLimits {
        max_connections: pick_u64(cli.max_connections, &var, "ETHTUN_MAX_CONNECTIONS", limits.max_connections)?,
        max_connections_per_ip: pick_u64(
            cli.max_connections_per_ip,
            &var,
            "ETHTUN_MAX_CONNECTIONS_PER_IP",
            limits.max_connections_per_ip,
        )?,
        max_tunnels_per_session: pick_u64(
            cli.max_tunnels_per_session,
            &var,
            "ETHTUN_MAX_TUNNELS_PER_SESSION",
            limits.max_tunnels_per_session,
        )?,
    };
    let quota = QuotaLimits {
        max_bytes_per_connection: pick_u64(
            cli.max_bytes_per_connection,
            &var,
            "ETHTUN_MAX_BYTES_PER_CONNECTION",
            limits.max_bytes_per_connection,
        )?,
        max_frames_per_second: pick_u64(
            cli.max_frames_per_second,
            &var,
            "ETHTUN_MAX_FRAMES_PER_SECOND",
            limits.max_frames_per_second,
        )?,
    };

    let ping_ms = pick_u64(cli.ping_interval_ms, &var, "ETHTUN_PING_INTERVAL_MS", file.server.ping_interval_ms)?;
    let ping_interval = (ping_ms > 0).then(|| Duration::from_millis(ping_ms));

    let relay = match cli.relay.clone().or_else(|| var("ETHTUN_RELAY")).or(file.server.relay) {
        Some(raw) => raw.parse().map_err(config_err)?,
        None => RelayTarget::Loopback,
    };

    Ok(ServerConfig {
        listen_addr,
        open_mode,
        allowed_origins,
        allowed_hosts,
        auth,
        admission,
        quota,
        ping_interval,
        relay,
        ..ServerConfig::default()
    })
}

fn resolve_origins(
    cli: &CliOverrides,
    var: &dyn Fn(&str) -> Option<String>,
    file: Option<Vec<String>>,
) -> TunnelResult<AllowedOrigins> {
    let sources = [
        cli.allowed_origins.clone(),
        var("ETHTUN_ALLOWED_ORIGINS"),
        var(FALLBACK_ORIGINS_VAR),
        file.map(|entries| entries.join(",")),
    ];
    for raw in sources.into_iter().flatten() {
        if let Some(parsed) = AllowedOrigins::parse(&raw).map_err(config_err)? {
            return Ok(parsed);
        }
    }
    Ok(AllowedOrigins::List(Vec::new()))
}

fn resolve_auth(
    cli: &CliOverrides,
    var: &dyn Fn(&str) -> Option<String>,
    file: AuthSection,
) -> TunnelResult<AuthScheme> {
    let token = var("ETHTUN_API_KEY")
        .or_else(|| var("ETHTUN_TOKEN"))
        .or(file.api_key)
        .or(file.token)
        .filter(|t| !t.is_empty());

    let mode = match cli.auth_mode.clone().or_else(|| var("ETHTUN_AUTH_MODE")).or(file.mode) {
        Some(raw) => raw.parse::<AuthMode>().map_err(config_err)?,
        None if token.is_some() => AuthMode::Token,
        None => {
            return Err(config_err(
                "no auth mode configured; set ETHTUN_AUTH_MODE (use \"none\" to disable authentication)",
            ))
        }
    };

    let scheme = match mode {
        AuthMode::None => AuthScheme::None,
        AuthMode::Token => AuthScheme::Token {
            secret: token.ok_or_else(|| config_err("token auth requires ETHTUN_TOKEN or ETHTUN_API_KEY"))?,
        },
        AuthMode::Session => AuthScheme::Session {
            secret: var("ETHTUN_SESSION_SECRET")
                .or(file.session_secret)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| config_err("session auth requires ETHTUN_SESSION_SECRET"))?
                .into_bytes(),
        },
        AuthMode::Jwt => AuthScheme::Jwt {
            secret: var("ETHTUN_JWT_SECRET")
                .or(file.jwt_secret)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| config_err("jwt auth requires ETHTUN_JWT_SECRET"))?
                .into_bytes(),
            validation: JwtValidation {
                audience: var("ETHTUN_JWT_AUDIENCE").or(file.jwt_audience),
                issuer: var("ETHTUN_JWT_ISSUER").or(file.jwt_issuer),
            },
        },
    };
    Ok(scheme)
}

fn pick_u64(
    cli: Option<u64>,
    var: &dyn Fn(&str) -> Option<String>,
    key: &str,
    file: Option<u64>,
) -> TunnelResult<u64> {
    if let Some(v) = cli {
        return Ok(v);
    }
    if let Some(raw) = var(key) {
        return raw
            .trim()
            .parse()
            .map_err(|e| config_err(format!("invalid {key}={raw:?}: {e}")));
    }
    Ok(file.unwrap_or(0))
}

fn parse_bool(key: &str, raw: &str) -> TunnelResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(config_err(format!("invalid {key}={raw:?}: expected a boolean"))),
    }
}

fn config_err(msg: impl Into<String>) -> TunnelError {
    TunnelError::Configuration(msg.into())
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
