//! Axum layer that gates routes by a rate limiting policy.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::ratelimit::{forwarded_client_ip, AdmissionEngine, RateLimitExceeded, RequestInfo};

/// Caller identity inserted into request extensions by authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity(pub String);

/// State of the [`rate_limit`] middleware: which policy guards the routes.
#[derive(Clone)]
pub struct PolicyGate {
    engine: AdmissionEngine,
    policy: Arc<str>,
    trust_forwarded_headers: bool,
}

impl PolicyGate {
    /// Gate routes with the policy registered as `policy`.
    pub fn new(engine: AdmissionEngine, policy: &str) -> Self {
        Self {
            engine,
            policy: Arc::from(policy),
            trust_forwarded_headers: false,
        }
    }

    /// Whether forwarding headers may declare the client address. Off by
    /// default; enable behind a proxy that sets them.
    pub fn trust_forwarded_headers(mut self, trust: bool) -> Self {
        self.trust_forwarded_headers = trust;
        self
    }
}

/// Describe an incoming request for key resolution.
pub fn request_info(req: &Request, trust_forwarded_headers: bool) -> RequestInfo {
    let remote_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);
    let client_ip = if trust_forwarded_headers {
        forwarded_client_ip(req.headers())
    } else {
        None
    };

    RequestInfo {
        method: req.method().to_string(),
        path: req.uri().path().to_string(),
        client_ip,
        remote_addr,
        headers: req.headers().clone(),
        identity: req
            .extensions()
            .get::<CallerIdentity>()
            .map(|id| id.0.clone()),
    }
}

/// Admit or refuse a request before it reaches the handler.
///
/// Admitted responses carry `X-RateLimit-*` headers; refused requests get a
/// 429 with `Retry-After`.
pub async fn rate_limit(State(gate): State<PolicyGate>, req: Request, next: Next) -> Response {
    let info = request_info(&req, gate.trust_forwarded_headers);

    match gate.engine.consume_named(&gate.policy, &info).await {
        Ok(admission) => {
            let mut response = next.run(req).await;
            if let Some(quota) = admission.info() {
                response.headers_mut().extend(quota.headers());
            }
            response
        }
        Err(exceeded) => exceeded.into_response(),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ThrottledBody {
    error: String,
    retry_after: u64,
    ms_before_next: u64,
}

impl IntoResponse for RateLimitExceeded {
    fn into_response(self) -> Response {
        let body = Json(ThrottledBody {
            error: self.to_string(),
            retry_after: self.retry_after_secs(),
            ms_before_next: self.ms_before_next,
        });
        (self.status(), self.headers(), body).into_response()
    }
}
