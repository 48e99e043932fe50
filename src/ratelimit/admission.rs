//! Admission decisions.
//!
//! This is the single place where store failures are converted into a
//! decision: they fail open. Only an exceeded policy reaches the caller as an
//! error.

use std::sync::Arc;

use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use thiserror::Error;
use tracing::{error, trace, warn};

use super::key::{resolve_key, RequestInfo};
use super::limiter::LimiterStatus;
use super::policy::Policy;
use super::registry::PolicyRegistry;
use crate::error::{Result, TollgateError};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Quota information reported with an admitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// Requests allowed per window
    pub limit: u32,
    /// Requests left in the current window
    pub remaining: u32,
    /// Epoch milliseconds at which the window resets
    pub reset_at_ms: i64,
}

impl RateLimitInfo {
    /// `X-RateLimit-*` headers describing the remaining quota.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(self.reset_at_ms));
        headers
    }
}

/// A request that may proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The request was counted and is within its quota
    Counted(RateLimitInfo),
    /// The decision could not be made and the request was let through
    FailedOpen,
}

impl Admission {
    /// Quota information, when the request was counted.
    pub fn info(&self) -> Option<&RateLimitInfo> {
        match self {
            Admission::Counted(info) => Some(info),
            Admission::FailedOpen => None,
        }
    }
}

/// The client exceeded a policy and must wait before retrying.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Too many requests, please try again in {} seconds", wait_secs(.ms_before_next))]
pub struct RateLimitExceeded {
    /// Policy that refused the request
    pub policy: String,
    /// Resolved client key
    pub key: String,
    /// Requests allowed per window
    pub limit: u32,
    /// Milliseconds until the client may be admitted again
    pub ms_before_next: u64,
    /// Epoch milliseconds at which the client may be admitted again
    pub reset_at_ms: i64,
}

impl RateLimitExceeded {
    /// HTTP status of the throttling response.
    pub fn status(&self) -> StatusCode {
        StatusCode::TOO_MANY_REQUESTS
    }

    /// Wait time in whole seconds, rounded up and never zero.
    pub fn retry_after_secs(&self) -> u64 {
        wait_secs(&self.ms_before_next)
    }

    /// `Retry-After` and `X-RateLimit-*` headers of the throttling response.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from(self.retry_after_secs()));
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from_static("0"));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(self.reset_at_ms));
        headers
    }
}

/// Decides whether requests are admitted under a policy.
#[derive(Clone)]
pub struct AdmissionEngine {
    registry: Arc<PolicyRegistry>,
}

impl AdmissionEngine {
    /// Create an engine over `registry`.
    pub fn new(registry: Arc<PolicyRegistry>) -> Self {
        Self { registry }
    }

    /// The registry this engine reads policies from.
    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    /// Count `request` against the policy registered as `policy_name`.
    ///
    /// An unknown policy name is a configuration mistake, not the client's;
    /// it is logged and the request fails open.
    pub async fn consume_named(
        &self,
        policy_name: &str,
        request: &RequestInfo,
    ) -> std::result::Result<Admission, RateLimitExceeded> {
        match self.registry.policy(policy_name) {
            Some(policy) => self.consume(&policy, request).await,
            None => {
                error!(policy = %policy_name, path = %request.path, "Unknown rate limit policy");
                Ok(Admission::FailedOpen)
            }
        }
    }

    /// Count `request` against `policy`.
    ///
    /// Store failures are logged and the request is admitted.
    pub async fn consume(
        &self,
        policy: &Policy,
        request: &RequestInfo,
    ) -> std::result::Result<Admission, RateLimitExceeded> {
        let key = resolve_key(request, policy.key_generator.as_ref());
        let limiter = self.registry.limiter_for(policy);

        let decision = match limiter.consume(&key).await {
            Ok(decision) => decision,
            Err(e) => {
                error!(
                    policy = %policy.name,
                    key = %key,
                    error = %e,
                    "Rate limit check failed, admitting request"
                );
                return Ok(Admission::FailedOpen);
            }
        };

        let reset_at_ms = reset_at(decision.ms_before_next);

        if decision.allowed {
            trace!(
                policy = %policy.name,
                key = %key,
                remaining = decision.remaining,
                "Request admitted"
            );
            return Ok(Admission::Counted(RateLimitInfo {
                limit: decision.limit,
                remaining: decision.remaining,
                reset_at_ms,
            }));
        }

        warn!(
            policy = %policy.name,
            key = %key,
            path = %request.path,
            method = %request.method,
            ms_before_next = decision.ms_before_next,
            blocked = decision.blocked,
            "Rate limit exceeded"
        );

        Err(RateLimitExceeded {
            policy: policy.name.clone(),
            key,
            limit: decision.limit,
            ms_before_next: decision.ms_before_next,
            reset_at_ms,
        })
    }

    /// Current state of `client_key` under `policy_name`, without counting a hit.
    pub async fn status(&self, policy_name: &str, client_key: &str) -> Result<LimiterStatus> {
        let policy = self.lookup(policy_name)?;
        self.registry.limiter_for(&policy).status(client_key).await
    }

    /// Clear the counter and block marker of `client_key` under `policy_name`,
    /// for example after a successful login.
    pub async fn reset(&self, policy_name: &str, client_key: &str) -> Result<()> {
        let policy = self.lookup(policy_name)?;
        self.registry.limiter_for(&policy).reset(client_key).await
    }

    fn lookup(&self, policy_name: &str) -> Result<Policy> {
        self.registry
            .policy(policy_name)
            .ok_or_else(|| TollgateError::UnknownPolicy(policy_name.to_string()))
    }
}

fn wait_secs(ms_before_next: &u64) -> u64 {
    ms_before_next.div_ceil(1000).max(1)
}

fn reset_at(ms_before_next: u64) -> i64 {
    let wait = i64::try_from(ms_before_next).unwrap_or(i64::MAX);
    chrono::Utc::now().timestamp_millis().saturating_add(wait)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::policy::{ADMIN, AUTH};
    use crate::store::{CounterStore, StoreBackend};
    use futures::future::join_all;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn engine() -> AdmissionEngine {
        let registry = PolicyRegistry::new(Arc::new(CounterStore::local()));
        for policy in Policy::builtin("rate_limit") {
            registry.register(policy).unwrap();
        }
        AdmissionEngine::new(Arc::new(registry))
    }

    fn from(ip: &str) -> RequestInfo {
        RequestInfo::new("POST", "/api/contact").with_client_ip(ip)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sixth_request_is_throttled() {
        let engine = engine();
        let policy = Policy::new("burst", "rate_limit:burst", 5, 60);

        for _ in 0..5 {
            let admission = engine.consume(&policy, &from("1.2.3.4")).await.unwrap();
            assert!(admission.info().is_some());
        }

        let err = engine.consume(&policy, &from("1.2.3.4")).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.key, "1.2.3.4");
        assert_eq!(err.limit, 5);
        assert!(err.retry_after_secs() <= 60);

        let headers = err.headers();
        let retry_after: u64 = headers[RETRY_AFTER].to_str().unwrap().parse().unwrap();
        assert!(retry_after <= 60);
        assert_eq!(headers[X_RATELIMIT_LIMIT], "5");
        assert_eq!(headers[X_RATELIMIT_REMAINING], "0");
        assert!(headers.contains_key(X_RATELIMIT_RESET));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_block_survives_window() {
        let engine = engine();

        for _ in 0..10 {
            engine.consume_named(AUTH, &from("5.5.5.5")).await.unwrap();
        }
        assert!(engine.consume_named(AUTH, &from("5.5.5.5")).await.is_err());

        tokio::time::advance(Duration::from_secs(901)).await;

        let err = engine.consume_named(AUTH, &from("5.5.5.5")).await.unwrap_err();
        assert_eq!(err.retry_after_secs(), 3600 - 901);
    }

    #[tokio::test]
    async fn test_admitted_reports_quota() {
        let engine = engine();
        let admission = engine.consume_named(AUTH, &from("7.7.7.7")).await.unwrap();
        let info = admission.info().unwrap();

        assert_eq!(info.limit, 10);
        assert_eq!(info.remaining, 9);
        assert!(info.reset_at_ms > chrono::Utc::now().timestamp_millis());

        let headers = info.headers();
        assert_eq!(headers[X_RATELIMIT_REMAINING], "9");
    }

    #[tokio::test]
    async fn test_admin_counts_per_user() {
        let engine = engine();
        let policy = engine.registry().policy(ADMIN).unwrap();

        let alice = RequestInfo::new("GET", "/admin/projects")
            .with_client_ip("1.1.1.1")
            .with_identity("alice");
        engine.consume(&policy, &alice).await.unwrap();

        let status = engine.status(ADMIN, "user:alice").await.unwrap();
        assert_eq!(status.consumed, 1);
        let status = engine.status(ADMIN, "1.1.1.1").await.unwrap();
        assert_eq!(status.consumed, 0);
    }

    #[tokio::test]
    async fn test_unknown_policy_fails_open() {
        let engine = engine();
        let admission = engine.consume_named("missing", &from("1.1.1.1")).await.unwrap();
        assert_eq!(admission, Admission::FailedOpen);

        assert!(matches!(
            engine.status("missing", "1.1.1.1").await,
            Err(TollgateError::UnknownPolicy(_))
        ));
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let engine = engine();
        let policy = Policy::new("p", "rate_limit:p", 1, 60);

        // a non-integer counter makes the store fail the increment
        engine
            .registry()
            .store()
            .set("rate_limit:p:1.1.1.1", "garbage", None)
            .await
            .unwrap();

        for _ in 0..3 {
            let admission = engine.consume(&policy, &from("1.1.1.1")).await.unwrap();
            assert_eq!(admission, Admission::FailedOpen);
        }
    }

    #[tokio::test]
    async fn test_reset_lifts_block() {
        let engine = engine();
        for _ in 0..11 {
            let _ = engine.consume_named(AUTH, &from("8.8.8.8")).await;
        }
        assert_err!(engine.consume_named(AUTH, &from("8.8.8.8")).await);

        assert_ok!(engine.reset(AUTH, "8.8.8.8").await);
        assert_ok!(engine.consume_named(AUTH, &from("8.8.8.8")).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consumers_single_point() {
        let engine = engine();
        let policy = Policy::new("once", "rate_limit:once", 1, 60);

        let tasks = (0..40).map(|_| {
            let engine = engine.clone();
            let policy = policy.clone();
            tokio::spawn(async move { engine.consume(&policy, &from("9.9.9.9")).await.is_ok() })
        });

        let admitted = join_all(tasks)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();

        assert_eq!(admitted, 1);
    }

    #[test]
    fn test_message_rounds_up() {
        let err = RateLimitExceeded {
            policy: "public".to_string(),
            key: "k".to_string(),
            limit: 1,
            ms_before_next: 1001,
            reset_at_ms: 0,
        };
        assert_eq!(err.retry_after_secs(), 2);
        assert_eq!(err.to_string(), "Too many requests, please try again in 2 seconds");

        let err = RateLimitExceeded {
            ms_before_next: 0,
            ..err
        };
        assert_eq!(err.retry_after_secs(), 1);
    }
}
