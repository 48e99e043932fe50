//! Admission service handlers.

use axum::extract::{FromRef, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::error::TollgateError;
use crate::ratelimit::{forwarded_client_ip, Admission, AdmissionEngine, RequestInfo};
use crate::store::BackendKind;

/// Shared state of the service routes.
#[derive(Clone, FromRef)]
pub struct ServiceState {
    pub engine: AdmissionEngine,
    #[from_ref(skip)]
    pub trust_forwarded_headers: bool,
}

/// Health report of the service.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub backend: BackendKind,
    pub healthy: bool,
    pub policies: Vec<String>,
}

/// Report the active backend and whether it answers.
pub async fn health(State(engine): State<AdmissionEngine>) -> Json<HealthResponse> {
    let registry = engine.registry();
    let healthy = registry.cache().healthy().await;

    Json(HealthResponse {
        status: if healthy { "ok" } else { "degraded" },
        backend: registry.backend_kind(),
        healthy,
        policies: registry.policy_names(),
    })
}

/// A request to be admitted on behalf of another service.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CheckRequest {
    /// Explicit client key, bypassing the policy's key resolution
    pub key: Option<String>,
    /// Client address as seen by the caller
    pub ip: Option<String>,
    pub method: Option<String>,
    pub path: Option<String>,
    /// Signed-in user id, for identity-keyed policies
    pub identity: Option<String>,
}

impl CheckRequest {
    /// Describe the checked request. Without an explicit `ip`, trusted
    /// forwarding headers relayed by the caller name the client.
    fn request_info(&self, headers: HeaderMap, trust_forwarded_headers: bool) -> RequestInfo {
        let client_ip = self.ip.clone().or_else(|| {
            trust_forwarded_headers
                .then(|| forwarded_client_ip(&headers))
                .flatten()
        });

        RequestInfo {
            method: self.method.clone().unwrap_or_else(|| "GET".to_string()),
            path: self.path.clone().unwrap_or_else(|| "/".to_string()),
            client_ip,
            remote_addr: None,
            headers,
            identity: self.identity.clone(),
        }
    }
}

/// Outcome of an admitted check.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    pub allowed: bool,
    pub policy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<i64>,
    /// The decision could not be made and the request was let through
    pub degraded: bool,
}

/// Count one request against a policy.
///
/// Answers 200 when admitted and 429 with `Retry-After` when refused.
#[instrument(skip(state, headers, body), fields(policy = %policy_name))]
pub async fn check(
    State(state): State<ServiceState>,
    Path(policy_name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CheckRequest>,
) -> Response {
    let engine = &state.engine;
    let Some(mut policy) = engine.registry().policy(&policy_name) else {
        warn!("Check requested for unknown policy");
        return TollgateError::UnknownPolicy(policy_name).into_response();
    };

    if let Some(key) = body.key.clone().filter(|k| !k.trim().is_empty()) {
        policy = policy.with_key_generator(move |_| Some(key.clone()));
    }

    let request = body.request_info(headers, state.trust_forwarded_headers);
    debug!(path = %request.path, method = %request.method, "Processing admission check");

    match engine.consume(&policy, &request).await {
        Ok(admission) => {
            let info = admission.info().copied();
            let response = CheckResponse {
                allowed: true,
                policy: policy_name,
                limit: info.map(|i| i.limit),
                remaining: info.map(|i| i.remaining),
                reset_at: info.map(|i| i.reset_at_ms),
                degraded: matches!(admission, Admission::FailedOpen),
            };
            match info {
                Some(info) => (info.headers(), Json(response)).into_response(),
                None => Json(response).into_response(),
            }
        }
        Err(exceeded) => exceeded.into_response(),
    }
}

/// A client's window, read without counting a hit.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub policy: String,
    pub key: String,
    pub consumed: u64,
    pub remaining: u32,
    pub window_remaining_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_for_ms: Option<u64>,
}

pub async fn status(
    State(engine): State<AdmissionEngine>,
    Path((policy_name, key)): Path<(String, String)>,
) -> Result<Json<StatusResponse>, TollgateError> {
    let status = engine.status(&policy_name, &key).await?;

    Ok(Json(StatusResponse {
        policy: policy_name,
        key,
        consumed: status.consumed,
        remaining: status.remaining,
        window_remaining_ms: duration_ms(status.window_remaining),
        blocked_for_ms: status.blocked_for.map(duration_ms),
    }))
}

/// Forget a client's counter and block, e.g. after a successful login.
pub async fn reset(
    State(engine): State<AdmissionEngine>,
    Path((policy_name, key)): Path<(String, String)>,
) -> Result<StatusCode, TollgateError> {
    engine.reset(&policy_name, &key).await?;
    info!(policy = %policy_name, key = %key, "Rate limit reset");
    Ok(StatusCode::NO_CONTENT)
}

fn duration_ms(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for TollgateError {
    fn into_response(self) -> Response {
        let status = match &self {
            TollgateError::UnknownPolicy(_) => StatusCode::NOT_FOUND,
            TollgateError::Config(_) => StatusCode::BAD_REQUEST,
            _ => {
                error!(error = %self, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}
