//! `Origin` and `Host` header enforcement.

use tokio_tungstenite::tungstenite::http::{header, HeaderMap};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OriginError {
    #[error("missing origin")]
    Missing,
    #[error("multiple origin headers")]
    Multiple,
    #[error("invalid origin")]
    Invalid,
    #[error("origin not allowed")]
    NotAllowed,
}

/// Reduce an origin to `scheme://host[:port]`, lowercased, default port dropped.
///
/// Returns `None` for anything that is not a bare http(s) origin.
pub fn normalize_origin(raw: &str) -> Option<String> {
    if raw.is_empty() || raw == "null" {
        return None;
    }
    if raw.chars().any(|c| c.is_whitespace() || c.is_control() || c == '\\') {
        return None;
    }

    let url = Url::parse(raw).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    if !url.username().is_empty() || url.password().is_some() {
        return None;
    }
    if url.query().is_some() || url.fragment().is_some() {
        return None;
    }
    // The parser turns an empty path into "/", so look at the raw text to
    // allow at most one trailing slash.
    let after_scheme = raw.split_once("://")?.1;
    match after_scheme.find('/') {
        None => {}
        Some(idx) if idx + 1 == after_scheme.len() => {}
        Some(_) => return None,
    }
    if url.path() != "/" {
        return None;
    }

    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedOrigins {
    /// `*`: any well-formed origin.
    Any,
    /// Normalized origins; empty allows nothing.
    List(Vec<String>),
}

impl AllowedOrigins {
    /// Parse a comma-separated allow-list.
    ///
    /// Returns `Ok(None)` when the input holds no entries at all, so callers
    /// can fall back to another source.
    pub fn parse(raw: &str) -> Result<Option<Self>, String> {
        let entries: Vec<&str> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if entries.is_empty() {
            return Ok(None);
        }
        if entries.contains(&"*") {
            return Ok(Some(AllowedOrigins::Any));
        }
        let mut list = Vec::with_capacity(entries.len());
        for entry in entries {
            let normalized = normalize_origin(entry)
                .ok_or_else(|| format!("invalid allowed origin entry: {entry:?}"))?;
            if !list.contains(&normalized) {
                list.push(normalized);
            }
        }
        Ok(Some(AllowedOrigins::List(list)))
    }
}

#[derive(Debug, Clone)]
pub struct OriginPolicy {
    allowed: AllowedOrigins,
}

impl OriginPolicy {
    pub fn new(allowed: AllowedOrigins) -> Self {
        Self { allowed }
    }

    /// Check the request's `Origin` header(s) and return the normalized origin.
    pub fn check(&self, headers: &HeaderMap) -> Result<String, OriginError> {
        let mut values = headers.get_all(header::ORIGIN).iter();
        let value = values.next().ok_or(OriginError::Missing)?;
        if values.next().is_some() {
            return Err(OriginError::Multiple);
        }
        let raw = value.to_str().map_err(|_| OriginError::Invalid)?.trim();
        if raw.is_empty() {
            return Err(OriginError::Missing);
        }
        let origin = normalize_origin(raw).ok_or(OriginError::Invalid)?;

        match &self.allowed {
            AllowedOrigins::Any => Ok(origin),
            AllowedOrigins::List(list) if list.contains(&origin) => Ok(origin),
            AllowedOrigins::List(_) => Err(OriginError::NotAllowed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    #[error("missing host")]
    Missing,
    #[error("malformed host")]
    Invalid,
    #[error("host not allowed")]
    NotAllowed,
}

/// Reduce a `Host` value to `host[:port]`, lowercased, port 80 dropped.
pub fn normalize_host(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '/' | '\\' | '?' | '#' | '@'))
    {
        return None;
    }

    let url = Url::parse(&format!("http://{raw}/")).ok()?;
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// `Host` allow-list. An empty list disables the check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostPolicy {
    allowed: Vec<String>,
}

impl HostPolicy {
    /// Parse a comma-separated list of hosts, normalizing each entry.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut allowed = Vec::new();
        for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let normalized =
                normalize_host(entry).ok_or_else(|| format!("invalid allowed host entry: {entry:?}"))?;
            if !allowed.contains(&normalized) {
                allowed.push(normalized);
            }
        }
        Ok(Self { allowed })
    }

    pub fn is_enforced(&self) -> bool {
        !self.allowed.is_empty()
    }

    pub fn check(&self, headers: &HeaderMap) -> Result<(), HostError> {
        if !self.is_enforced() {
            return Ok(());
        }
        let value = headers.get(header::HOST).ok_or(HostError::Missing)?;
        let raw = value.to_str().map_err(|_| HostError::Invalid)?;
        if raw.trim().is_empty() {
            return Err(HostError::Missing);
        }
        let host = normalize_host(raw).ok_or(HostError::Invalid)?;
        if self.allowed.contains(&host) {
            Ok(())
        } else {
            Err(HostError::NotAllowed)
        }
    }
}
