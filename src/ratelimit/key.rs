//! Request descriptors and client key resolution.

use std::net::SocketAddr;

use axum::http::HeaderMap;
use tracing::warn;

use super::policy::KeyGenerator;

/// What the admission layer needs to know about an incoming request.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    /// HTTP method
    pub method: String,
    /// Request path
    pub path: String,
    /// Client address declared by the request (forwarding headers)
    pub client_ip: Option<String>,
    /// Transport-level peer address
    pub remote_addr: Option<SocketAddr>,
    /// Raw request headers
    pub headers: HeaderMap,
    /// Caller identity resolved by authentication, if any
    pub identity: Option<String>,
}

impl RequestInfo {
    /// Create a descriptor for `method` and `path` with nothing else known.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// Client address declared by forwarding headers.
///
/// `X-Forwarded-For` wins, then `X-Real-IP`. Only the last non-empty
/// `X-Forwarded-For` hop is read: it is the one appended by the proxy in
/// front of this service, while earlier hops are whatever the client sent.
pub fn forwarded_client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').map(str::trim).rev().find(|ip| !ip.is_empty()))
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|h| h.to_str().ok())
                .map(str::trim)
        })
        .and_then(usable)
}

/// Resolve the client key for `request`. Never returns an empty string.
///
/// Order: the custom generator, the declared client address, the transport
/// address, and finally a unique per-request token. The token means a request
/// with no address information at all gets a counter of its own instead of
/// bypassing the limiter or sharing one bucket with every anonymous caller.
pub fn resolve_key(request: &RequestInfo, generator: Option<&KeyGenerator>) -> String {
    if let Some(key) = generator.and_then(|g| g(request)).and_then(usable) {
        return key;
    }

    if let Some(ip) = request.client_ip.as_deref().and_then(usable) {
        return ip;
    }

    if let Some(addr) = request.remote_addr {
        return addr.ip().to_string();
    }

    let token = anonymous_token();
    warn!(
        path = %request.path,
        method = %request.method,
        key = %token,
        "No client address available, using a one-off key"
    );
    token
}

fn usable(candidate: impl AsRef<str>) -> Option<String> {
    let trimmed = candidate.as_ref().trim();
    match trimmed {
        "" | "undefined" | "null" => None,
        _ => Some(trimmed.to_string()),
    }
}

fn anonymous_token() -> String {
    format!(
        "anon:{}:{:016x}",
        chrono::Utc::now().timestamp_millis(),
        rand::random::<u64>()
    )
}
