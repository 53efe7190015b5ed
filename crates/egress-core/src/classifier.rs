//! Request classification.
//!
//! Looks only at the first line of a client request, decides between a
//! CONNECT tunnel and a plain HTTP relay, extracts the target, and gates it
//! against the blacklist. A blocked request never yields a target to connect
//! to.

use std::fmt;

use url::{Position, Url};

use crate::blacklist::{normalize_host, BlacklistSnapshot};
use crate::error::ClassifyError;

/// Default port for CONNECT targets without an explicit port.
pub const DEFAULT_TUNNEL_PORT: u16 = 443;

/// Default port for plain HTTP targets.
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Where a session must connect. Resolved once, never changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    /// Lowercase host name or IP literal (IPv6 without brackets).
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// True for CONNECT tunnels.
    pub is_tunnel: bool,
}

impl Target {
    /// Creates a new target.
    pub fn new(host: impl Into<String>, port: u16, is_tunnel: bool) -> Self {
        Self {
            host: host.into(),
            port,
            is_tunnel,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A parsed, not-yet-gated request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedRequest {
    /// Request method exactly as sent.
    pub method: String,
    /// Request target exactly as sent.
    pub uri: String,
    /// Protocol version, if present. Accepted but not interpreted.
    pub version: Option<String>,
    /// Resolved connection target.
    pub target: Target,
    /// Origin-form target (`/path?query`) for plain requests.
    origin_form: Option<String>,
    /// Normalised absolute URL for plain requests.
    normalized_url: Option<String>,
}

impl ClassifiedRequest {
    /// True for CONNECT requests.
    pub fn is_tunnel(&self) -> bool {
        self.target.is_tunnel
    }

    /// True for GET requests, the only ones whose responses are cached.
    pub fn is_get(&self) -> bool {
        self.method == "GET"
    }

    /// The cache key for this request, when its response may be cached.
    pub fn cache_key(&self) -> Option<&str> {
        if self.is_get() {
            self.normalized_url.as_deref()
        } else {
            None
        }
    }

    /// Returns the request line rewritten to origin-form, without CRLF.
    ///
    /// CONNECT lines are returned unchanged.
    pub fn origin_request_line(&self) -> String {
        let target = self.origin_form.as_deref().unwrap_or(&self.uri);
        match &self.version {
            Some(version) => format!("{} {} {}", self.method, target, version),
            None => format!("{} {}", self.method, target),
        }
    }
}

/// Result of gating a request line against the blacklist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Not blocked; connect to `request.target`.
    Allowed(ClassifiedRequest),
    /// Blocked. No connection may be attempted.
    Blocked(Target),
}

/// Parses a request line (no trailing CRLF) and consults the blacklist.
///
/// # Examples
///
/// ```
/// use egress_core::{classify, BlacklistSnapshot, Classification};
///
/// let blacklist = BlacklistSnapshot::parse_all(["*.example.com"]).unwrap();
/// let result = classify("CONNECT sub.example.com:443 HTTP/1.1", &blacklist).unwrap();
/// assert!(matches!(result, Classification::Blocked(t) if t.is_tunnel));
/// ```
pub fn classify(
    line: &str,
    blacklist: &BlacklistSnapshot,
) -> Result<Classification, ClassifyError> {
    let request = parse_request_line(line)?;

    if blacklist.is_blocked(&request.target.host) {
        return Ok(Classification::Blocked(request.target));
    }

    Ok(Classification::Allowed(request))
}

/// Parses a request line without consulting any blacklist.
pub fn parse_request_line(line: &str) -> Result<ClassifiedRequest, ClassifyError> {
    let line = line.trim();
    let mut parts = line.split(' ');
    let method = parts.next().unwrap_or_default();
    let uri = parts.next().unwrap_or_default();
    let version = parts.next().filter(|v| !v.is_empty()).map(str::to_string);

    if method.is_empty() || uri.is_empty() {
        return Err(ClassifyError::MalformedLine(line.to_string()));
    }

    if method.eq_ignore_ascii_case("CONNECT") {
        let target = parse_authority(uri)?;
        return Ok(ClassifiedRequest {
            method: method.to_string(),
            uri: uri.to_string(),
            version,
            target,
            origin_form: None,
            normalized_url: None,
        });
    }

    let mut url = Url::parse(uri).map_err(|_| ClassifyError::InvalidTarget(uri.to_string()))?;
    if url.scheme() != "http" {
        return Err(ClassifyError::InvalidTarget(uri.to_string()));
    }

    let host = match url.host_str() {
        Some(h) if !h.is_empty() => strip_brackets(&normalize_host(h)).to_string(),
        _ => return Err(ClassifyError::InvalidTarget(uri.to_string())),
    };
    let port = url.port_or_known_default().unwrap_or(DEFAULT_HTTP_PORT);
    let origin_form = url[Position::BeforePath..Position::AfterQuery].to_string();

    url.set_fragment(None);

    Ok(ClassifiedRequest {
        method: method.to_string(),
        uri: uri.to_string(),
        version,
        target: Target::new(host, port, false),
        origin_form: Some(if origin_form.is_empty() {
            "/".to_string()
        } else {
            origin_form
        }),
        normalized_url: Some(url.to_string()),
    })
}

/// Parses a CONNECT authority (`host:port`, `host`, `[v6]:port`).
fn parse_authority(authority: &str) -> Result<Target, ClassifyError> {
    let invalid = || ClassifyError::InvalidTarget(authority.to_string());

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        match tail {
            "" => (host, None),
            _ => (host, Some(tail.strip_prefix(':').ok_or_else(invalid)?)),
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() || host.contains('/') {
        return Err(invalid());
    }

    let port = match port {
        None => DEFAULT_TUNNEL_PORT,
        Some(p) => match p.parse::<u16>() {
            Ok(port) if port != 0 => port,
            _ => return Err(ClassifyError::InvalidPort(authority.to_string())),
        },
    };

    Ok(Target::new(normalize_host(host), port, true))
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}
