//! Rate limiting policies, limiters and admission decisions.

mod admission;
mod key;
mod limiter;
mod policy;
mod registry;

pub use admission::{
    Admission, AdmissionEngine, RateLimitExceeded, RateLimitInfo, X_RATELIMIT_LIMIT,
    X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use key::{forwarded_client_ip, resolve_key, RequestInfo};
pub use limiter::{FixedWindowLimiter, LimiterStatus, RateLimitDecision};
pub use policy::{configured_policies, KeyGenerator, Policy, PolicySignature, ADMIN, AUTH, CONTACT, PUBLIC};
pub use registry::PolicyRegistry;
