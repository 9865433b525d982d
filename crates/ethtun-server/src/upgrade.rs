//! Upgrade-time admission: the gate every WebSocket handshake passes through.
//!
//! Checks run in a fixed order and stop at the first failure:
//!
//! | step | check                          | status |
//! |------|--------------------------------|--------|
//! | 0    | server shutting down           | 503    |
//! | 1    | path and tunnel sub-protocol   | 400    |
//! | 2    | credentials                    | 401    |
//! | 3    | `Origin` (skipped in open mode)| 403    |
//! | 4    | `Host` allow-list              | 403    |
//! | 5    | per-client-IP cap              | 429    |
//! | 6    | global connection cap          | 429    |
//! | 7    | per-session tunnel cap         | 429    |
//!
//! Authentication runs before the origin check so that unauthenticated
//! callers learn nothing about the origin policy.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ethtun_core::{
    unix_now, TunnelError, SESSION_COOKIE_NAME, TOKEN_SUBPROTOCOL_PREFIX, TUNNEL_SUBPROTOCOL,
};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request};
use tokio_tungstenite::tungstenite::http::{header, HeaderMap, HeaderValue, Response, StatusCode};
use tracing::{debug, info, warn};

use crate::admission::{AdmissionController, AdmissionDenied, GlobalPermit, IpPermit, SessionPermit};
use crate::auth::{AuthResolver, SessionIdentity};
use crate::origin::{HostPolicy, OriginPolicy};

/// Paths a tunnel may be opened on. `/eth` is kept for older clients.
pub const TUNNEL_PATHS: [&str; 4] = ["/l2", "/l2/", "/eth", "/eth/"];

/// The parts of a handshake request the gate looks at.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub path: String,
    /// Offered `Sec-WebSocket-Protocol` entries, in order.
    pub subprotocols: Vec<String>,
    pub headers: HeaderMap,
    /// Percent-decoded query pairs, in order.
    pub query: Vec<(String, String)>,
    pub remote: Option<SocketAddr>,
}

impl UpgradeRequest {
    pub fn from_http(req: &Request, remote: Option<SocketAddr>) -> Self {
        let headers = req.headers().clone();
        let subprotocols = headers
            .get_all(header::SEC_WEBSOCKET_PROTOCOL)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        let query = req
            .uri()
            .query()
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();

        Self {
            path: req.uri().path().to_string(),
            subprotocols,
            headers,
            query,
            remote,
        }
    }

    /// First value of query parameter `name`.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// First cookie called `name` across every `Cookie` header.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(k, _)| k.trim() == name)
            .map(|(_, v)| v.trim())
    }

    pub fn offers_tunnel_protocol(&self) -> bool {
        self.subprotocols.iter().any(|p| p == TUNNEL_SUBPROTOCOL)
    }

    /// Credential carried as `ethtun-token.<value>` in the sub-protocol list.
    pub fn subprotocol_token(&self) -> Option<&str> {
        self.subprotocols
            .iter()
            .find_map(|p| p.strip_prefix(TOKEN_SUBPROTOCOL_PREFIX))
    }

    fn token_present(&self) -> bool {
        self.query_param("token").is_some_and(|v| !v.is_empty())
            || self.query_param("apiKey").is_some_and(|v| !v.is_empty())
            || self.subprotocol_token().is_some_and(|v| !v.is_empty())
            || self.headers.contains_key(header::AUTHORIZATION)
    }

    fn cookie_present(&self) -> bool {
        self.cookie(SESSION_COOKIE_NAME).is_some_and(|v| !v.is_empty())
    }

    fn origin_header(&self) -> Option<&str> {
        self.headers.get(header::ORIGIN).and_then(|v| v.to_str().ok())
    }
}

/// A refused upgrade: the HTTP status and a short plain-text reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: StatusCode,
    pub reason: String,
}

impl Rejection {
    fn new(status: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    /// Build the handshake error response carrying the reason as its body.
    pub fn into_response(self) -> ErrorResponse {
        let mut resp = Response::new(Some(self.reason));
        *resp.status_mut() = self.status;
        resp.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        resp
    }
}

impl From<TunnelError> for Rejection {
    fn from(err: TunnelError) -> Self {
        let (status, reason) = match err {
            TunnelError::MalformedUpgrade(reason) => (StatusCode::BAD_REQUEST, reason),
            TunnelError::AuthFailure(reason) => (StatusCode::UNAUTHORIZED, reason),
            TunnelError::OriginDenied(reason) => (StatusCode::FORBIDDEN, reason),
            TunnelError::AdmissionDenied(reason) => (StatusCode::TOO_MANY_REQUESTS, reason),
            TunnelError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "shutting down".to_string()),
            other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        };
        Rejection::new(status, reason)
    }
}

/// Everything an admitted tunnel carries out of the handshake.
///
/// Dropping it without starting a tunnel returns every permit.
#[derive(Debug)]
pub struct Admission {
    pub tunnel_id: u64,
    pub identity: Option<SessionIdentity>,
    /// Normalized `Origin`, when one was checked.
    pub origin: Option<String>,
    /// Held when the client address is known.
    pub ip_permit: Option<IpPermit>,
    pub global_permit: GlobalPermit,
    pub session_permit: Option<SessionPermit>,
}

#[derive(Debug)]
pub struct Gatekeeper {
    auth: AuthResolver,
    origin: OriginPolicy,
    hosts: HostPolicy,
    open_mode: bool,
    admission: AdmissionController,
    shutting_down: AtomicBool,
    next_tunnel_id: AtomicU64,
}

impl Gatekeeper {
    pub fn new(
        auth: AuthResolver,
        origin: OriginPolicy,
        hosts: HostPolicy,
        open_mode: bool,
        admission: AdmissionController,
    ) -> Arc<Self> {
        Arc::new(Self {
            auth,
            origin,
            hosts,
            open_mode,
            admission,
            shutting_down: AtomicBool::new(false),
            next_tunnel_id: AtomicU64::new(1),
        })
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Refuse every later upgrade with 503.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn admit(&self, req: &UpgradeRequest) -> Result<Admission, Rejection> {
        self.admit_at(req, unix_now())
    }

    /// Run the gate with an explicit clock for credential expiry.
    pub fn admit_at(&self, req: &UpgradeRequest, now: u64) -> Result<Admission, Rejection> {
        let result = self.evaluate(req, now).map_err(Rejection::from);
        match &result {
            Ok(admission) => debug!(
                tunnel_id = admission.tunnel_id,
                session_id = admission.identity.as_ref().map(|i| i.session_id.as_str()),
                remote = ?req.remote,
                "upgrade admitted"
            ),
            Err(rejection) if rejection.status == StatusCode::SERVICE_UNAVAILABLE => info!(
                reason = %rejection.reason,
                remote = ?req.remote,
                "upgrade refused during shutdown"
            ),
            Err(rejection) => warn!(
                status = rejection.status.as_u16(),
                reason = %rejection.reason,
                auth_mode = %self.auth.mode(),
                origin = req.origin_header(),
                token_present = req.token_present(),
                cookie_present = req.cookie_present(),
                remote = ?req.remote,
                "upgrade rejected"
            ),
        }
        result
    }

    fn evaluate(&self, req: &UpgradeRequest, now: u64) -> Result<Admission, TunnelError> {
        if self.is_shutting_down() {
            return Err(TunnelError::ShuttingDown);
        }

        if !TUNNEL_PATHS.contains(&req.path.as_str()) {
            return Err(TunnelError::MalformedUpgrade("unknown tunnel path".into()));
        }
        if !req.offers_tunnel_protocol() {
            return Err(TunnelError::MalformedUpgrade(format!(
                "missing required subprotocol {TUNNEL_SUBPROTOCOL}"
            )));
        }

        let outcome = self
            .auth
            .resolve(req, now)
            .map_err(|err| TunnelError::AuthFailure(err.to_string()))?;

        let origin = if self.open_mode {
            None
        } else {
            let origin = self
                .origin
                .check(&req.headers)
                .map_err(|err| TunnelError::OriginDenied(err.to_string()))?;
            Some(origin)
        };
        self.hosts
            .check(&req.headers)
            .map_err(|err| TunnelError::OriginDenied(err.to_string()))?;

        // Permits taken so far are returned by drop on any later rejection.
        let ip_permit = req
            .remote
            .map(|addr| self.admission.try_acquire_ip(addr.ip()))
            .transpose()
            .map_err(denied)?;
        let global_permit = self.admission.try_acquire_global().map_err(denied)?;
        let session_permit = outcome
            .identity
            .as_ref()
            .map(|identity| self.admission.try_acquire_session(&identity.session_id))
            .transpose()
            .map_err(denied)?;

        Ok(Admission {
            tunnel_id: self.next_tunnel_id.fetch_add(1, Ordering::Relaxed),
            identity: outcome.identity,
            origin,
            ip_permit,
            global_permit,
            session_permit,
        })
    }
}

fn denied(err: AdmissionDenied) -> TunnelError {
    TunnelError::AdmissionDenied(err.to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::admission::AdmissionLimits;
    use crate::auth::AuthScheme;
    use crate::origin::AllowedOrigins;
    use ethtun_core::mint_session_cookie;

    const NOW: u64 = 1_700_000_000;

    /// Build an [`UpgradeRequest`] the way the handshake callback would.
    pub(crate) fn request(uri: &str, protocols: &[&str], headers: &[(&str, &str)]) -> UpgradeRequest {
        let mut builder = Request::builder().uri(uri);
        if !protocols.is_empty() {
            builder = builder.header(header::SEC_WEBSOCKET_PROTOCOL, protocols.join(", "));
        }
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let req = builder.body(()).unwrap();
        UpgradeRequest::from_http(&req, None)
    }

    fn gatekeeper(scheme: AuthScheme, open_mode: bool, limits: AdmissionLimits) -> Arc<Gatekeeper> {
        Gatekeeper::new(
            AuthResolver::new(scheme),
            OriginPolicy::new(AllowedOrigins::List(vec!["https://allowed.test".into()])),
            HostPolicy::default(),
            open_mode,
            AdmissionController::new(limits),
        )
    }

    fn token_gate() -> Arc<Gatekeeper> {
        gatekeeper(
            AuthScheme::Token {
                secret: "sekrit".into(),
            },
            false,
            AdmissionLimits::default(),
        )
    }

    fn status(gate: &Gatekeeper, req: &UpgradeRequest) -> StatusCode {
        match gate.admit_at(req, NOW) {
            Ok(_) => StatusCode::SWITCHING_PROTOCOLS,
            Err(rejection) => rejection.status,
        }
    }

    #[test]
    fn request_parsing() {
        let req = request(
            "/l2?token=a%20b&token=second",
            &["ethtun-l2-v1", "ethtun-token.xyz"],
            &[("cookie", "a=1; ethtun_session=v")],
        );
        assert_eq!(req.path, "/l2");
        assert_eq!(req.query_param("token"), Some("a b"));
        assert_eq!(req.subprotocol_token(), Some("xyz"));
        assert_eq!(req.cookie("ethtun_session"), Some("v"));
        assert!(req.offers_tunnel_protocol());
    }

    #[test]
    fn subprotocol_required() {
        let gate = token_gate();
        let origin = [("origin", "https://allowed.test")];
        let req = request("/l2?token=sekrit", &[], &origin);
        assert_eq!(status(&gate, &req), StatusCode::BAD_REQUEST);
        // A credential entry alone does not count as the tunnel protocol.
        let req = request("/l2", &["ethtun-token.sekrit"], &origin);
        assert_eq!(status(&gate, &req), StatusCode::BAD_REQUEST);
        let req = request("/other?token=sekrit", &["ethtun-l2-v1"], &origin);
        assert_eq!(status(&gate, &req), StatusCode::BAD_REQUEST);
        for path in TUNNEL_PATHS {
            let uri = format!("{path}?token=sekrit");
            let req = request(&uri, &["ethtun-l2-v1"], &origin);
            assert_eq!(status(&gate, &req), StatusCode::SWITCHING_PROTOCOLS, "{path}");
        }
    }

    #[test]
    fn auth_checked_before_origin() {
        let gate = token_gate();
        let req = request("/l2", &["ethtun-l2-v1"], &[("origin", "https://blocked.test")]);
        assert_eq!(status(&gate, &req), StatusCode::UNAUTHORIZED);
        let req = request("/l2?token=sekrit", &["ethtun-l2-v1"], &[("origin", "https://blocked.test")]);
        assert_eq!(status(&gate, &req), StatusCode::FORBIDDEN);
    }

    #[test]
    fn open_mode_skips_origin_but_not_auth() {
        let gate = gatekeeper(
            AuthScheme::Token {
                secret: "sekrit".into(),
            },
            true,
            AdmissionLimits::default(),
        );
        let req = request("/l2", &["ethtun-l2-v1"], &[]);
        assert_eq!(status(&gate, &req), StatusCode::UNAUTHORIZED);
        let req = request("/l2?token=sekrit", &["ethtun-l2-v1"], &[("origin", "https://blocked.test")]);
        assert_eq!(status(&gate, &req), StatusCode::SWITCHING_PROTOCOLS);
    }

    #[test]
    fn global_limit_and_recovery() {
        let gate = gatekeeper(
            AuthScheme::None,
            true,
            AdmissionLimits {
                max_connections: 1,
                ..Default::default()
            },
        );
        let req = request("/l2", &["ethtun-l2-v1"], &[]);
        let first = gate.admit_at(&req, NOW).unwrap();
        let rejection = gate.admit_at(&req, NOW).unwrap_err();
        assert_eq!(rejection.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(rejection.reason, "max connections exceeded");
        drop(first);
        assert!(gate.admit_at(&req, NOW).is_ok());
    }

    #[test]
    fn session_limit_returns_global_permit() {
        let gate = gatekeeper(
            AuthScheme::Session {
                secret: b"cookie".to_vec(),
            },
            true,
            AdmissionLimits {
                max_tunnels_per_session: 1,
                ..Default::default()
            },
        );
        let cookie = format!(
            "ethtun_session={}",
            mint_session_cookie(b"cookie", "sid-1", NOW + 60).unwrap()
        );
        let req = request("/l2", &["ethtun-l2-v1"], &[("cookie", cookie.as_str())]);

        let first = gate.admit_at(&req, NOW).unwrap();
        assert_eq!(first.identity.as_ref().unwrap().session_id, "sid-1");
        let rejection = gate.admit_at(&req, NOW).unwrap_err();
        assert_eq!(rejection.reason, "max tunnels per session exceeded");
        assert_eq!(gate.admission().active_connections(), 1);
        drop(first);
        assert_eq!(gate.admission().active_connections(), 0);
        assert_eq!(gate.admission().session_tunnels("sid-1"), 0);
        assert!(gate.admit_at(&req, NOW).is_ok());
    }

    #[test]
    fn shutdown_refuses_with_503() {
        let gate = token_gate();
        gate.begin_shutdown();
        let req = request("/l2?token=sekrit", &["ethtun-l2-v1"], &[("origin", "https://allowed.test")]);
        assert_eq!(status(&gate, &req), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn tunnel_ids_are_unique() {
        let gate = gatekeeper(AuthScheme::None, true, AdmissionLimits::default());
        let req = request("/l2", &["ethtun-l2-v1"], &[]);
        let a = gate.admit_at(&req, NOW).unwrap();
        let b = gate.admit_at(&req, NOW).unwrap();
        assert_ne!(a.tunnel_id, b.tunnel_id);
    }

    #[test]
    fn rejection_response_carries_reason() {
        let resp = Rejection::new(StatusCode::FORBIDDEN, "origin not allowed").into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(resp.body().as_deref(), Some("origin not allowed"));
    }

    #[test]
    fn host_allow_list_applies_even_in_open_mode() {
        let gate = Gatekeeper::new(
            AuthResolver::new(AuthScheme::None),
            OriginPolicy::new(AllowedOrigins::Any),
            HostPolicy::parse("gateway.test").unwrap(),
            true,
            AdmissionController::new(AdmissionLimits::default()),
        );
        let ok = request("/l2", &["ethtun-l2-v1"], &[("host", "gateway.test:80")]);
        assert_eq!(status(&gate, &ok), StatusCode::SWITCHING_PROTOCOLS);
        let other = request("/l2", &["ethtun-l2-v1"], &[("host", "evil.test")]);
        let rejection = gate.admit_at(&other, NOW).unwrap_err();
        assert_eq!(rejection.status, StatusCode::FORBIDDEN);
        assert_eq!(rejection.reason, "host not allowed");
        let missing = request("/l2", &["ethtun-l2-v1"], &[]);
        assert_eq!(status(&gate, &missing), StatusCode::FORBIDDEN);
    }

    #[test]
    fn origin_is_checked_before_host() {
        let gate = Gatekeeper::new(
            AuthResolver::new(AuthScheme::None),
            OriginPolicy::new(AllowedOrigins::List(vec!["https://allowed.test".into()])),
            HostPolicy::parse("gateway.test").unwrap(),
            false,
            AdmissionController::new(AdmissionLimits::default()),
        );
        let req = request("/l2", &["ethtun-l2-v1"], &[("host", "evil.test")]);
        assert_eq!(gate.admit_at(&req, NOW).unwrap_err().reason, "missing origin");
    }

    #[test]
    fn per_ip_limit_and_recovery() {
        let gate = gatekeeper(
            AuthScheme::None,
            true,
            AdmissionLimits {
                max_connections_per_ip: 1,
                ..Default::default()
            },
        );
        let from = |addr: &str| {
            let mut req = request("/l2", &["ethtun-l2-v1"], &[]);
            req.remote = Some(addr.parse().unwrap());
            req
        };

        let first = gate.admit_at(&from("10.0.0.1:4000"), NOW).unwrap();
        let rejection = gate.admit_at(&from("10.0.0.1:4001"), NOW).unwrap_err();
        assert_eq!(rejection.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(rejection.reason, "max connections per ip exceeded");
        // The refused attempt holds nothing.
        assert_eq!(gate.admission().active_connections(), 1);

        assert!(gate.admit_at(&from("10.0.0.2:4000"), NOW).is_ok());
        drop(first);
        assert!(gate.admit_at(&from("10.0.0.1:4002"), NOW).is_ok());
    }

    #[test]
    fn global_rejection_returns_ip_permit() {
        let gate = gatekeeper(
            AuthScheme::None,
            true,
            AdmissionLimits {
                max_connections: 1,
                max_connections_per_ip: 5,
                ..Default::default()
            },
        );
        let mut req = request("/l2", &["ethtun-l2-v1"], &[]);
        req.remote = Some("10.0.0.1:4000".parse().unwrap());
        let _first = gate.admit_at(&req, NOW).unwrap();
        assert!(gate.admit_at(&req, NOW).is_err());
        assert_eq!(gate.admission().connections_from("10.0.0.1".parse().unwrap()), 1);
    }

    #[test]
    fn errors_map_to_statuses() {
        let cases = [
            (TunnelError::MalformedUpgrade("x".into()), StatusCode::BAD_REQUEST),
            (TunnelError::AuthFailure("x".into()), StatusCode::UNAUTHORIZED),
            (TunnelError::OriginDenied("x".into()), StatusCode::FORBIDDEN),
            (TunnelError::AdmissionDenied("x".into()), StatusCode::TOO_MANY_REQUESTS),
            (TunnelError::ShuttingDown, StatusCode::SERVICE_UNAVAILABLE),
            (TunnelError::Transport("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(Rejection::from(err).status, status);
        }
        assert_eq!(
            Rejection::from(TunnelError::OriginDenied("origin not allowed".into())).reason,
            "origin not allowed"
        );
    }
}
