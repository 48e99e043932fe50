//! HTTP surface: the admission service and the route-gating layer.

mod middleware;
mod server;
mod service;

use axum::routing::{delete, get, post};
use axum::Router;

use crate::config::ServerConfig;
use crate::ratelimit::AdmissionEngine;
use service::ServiceState;

pub use middleware::{rate_limit, request_info, CallerIdentity, PolicyGate};
pub use server::HttpServer;
pub use service::{CheckRequest, CheckResponse, HealthResponse, StatusResponse};

/// Routes of the admission service.
pub fn router(engine: AdmissionEngine, server: &ServerConfig) -> Router {
    let state = ServiceState {
        engine,
        trust_forwarded_headers: server.trust_forwarded_headers,
    };

    Router::new()
        .route("/health", get(service::health))
        .route("/v1/check/{policy}", post(service::check))
        .route("/v1/status/{policy}/{key}", get(service::status))
        .route("/v1/limits/{policy}/{key}", delete(service::reset))
        .with_state(state)
}
