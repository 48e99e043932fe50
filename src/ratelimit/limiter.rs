//! Fixed-window limiter bound to one policy signature.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::policy::PolicySignature;
use crate::error::Result;
use crate::store::{CounterStore, StoreBackend};

/// Outcome of counting one request against a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests allowed per window
    pub limit: u32,
    /// Hits counted in the current window (0 when refused by a block marker)
    pub consumed: u64,
    /// Requests left in the current window
    pub remaining: u32,
    /// Time until the client may be admitted again (denied) or the window resets (allowed)
    pub ms_before_next: u64,
    /// Whether the request was refused by a block marker
    pub blocked: bool,
}

/// Current state of a client's window, read without counting a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterStatus {
    /// Hits counted in the current window
    pub consumed: u64,
    /// Requests left in the current window
    pub remaining: u32,
    /// Time until the window resets
    pub window_remaining: Duration,
    /// Remaining block time, if the client is blocked
    pub blocked_for: Option<Duration>,
}

/// A fixed-window rate limiter.
///
/// One limiter exists per policy signature; the counters themselves live in
/// the shared [`CounterStore`].
pub struct FixedWindowLimiter {
    signature: PolicySignature,
    store: Arc<CounterStore>,
}

impl FixedWindowLimiter {
    /// Create a limiter for `signature` over `store`.
    pub fn new(signature: PolicySignature, store: Arc<CounterStore>) -> Self {
        Self { signature, store }
    }

    /// The signature this limiter enforces.
    pub fn signature(&self) -> &PolicySignature {
        &self.signature
    }

    /// Count one request for `client_key` and decide whether it is admitted.
    ///
    /// An active block marker refuses the request without touching the
    /// counter. Exceeding the window writes a block marker when the policy
    /// defines a block duration.
    pub async fn consume(&self, client_key: &str) -> Result<RateLimitDecision> {
        let sig = &self.signature;
        let block_key = sig.block_key(client_key);

        if sig.blocks() {
            if let Some(left) = self.store.block_remaining(&block_key).await? {
                trace!(key = %block_key, "Client is blocked");
                return Ok(self.denied(0, left, true));
            }
        }

        let hit = self
            .store
            .increment(&sig.counter_key(client_key), sig.duration)
            .await?;

        if hit.count <= u64::from(sig.points) {
            let remaining = sig.points - hit.count as u32;
            return Ok(RateLimitDecision {
                allowed: true,
                limit: sig.points,
                consumed: hit.count,
                remaining,
                ms_before_next: as_millis(hit.remaining),
                blocked: false,
            });
        }

        if sig.blocks() {
            self.store.block(&block_key, sig.block_duration).await?;
            debug!(
                key = %block_key,
                block_secs = sig.block_duration.as_secs(),
                "Window exceeded, client blocked"
            );
            // The first violation reports the block, not the window: the
            // block just written outlives the window and refuses every retry
            // until it expires.
            let wait = hit.remaining.max(sig.block_duration);
            return Ok(self.denied(hit.count, wait, true));
        }

        Ok(self.denied(hit.count, hit.remaining, false))
    }

    /// Read the state of `client_key` without counting a hit.
    pub async fn status(&self, client_key: &str) -> Result<LimiterStatus> {
        let sig = &self.signature;
        let blocked_for = if sig.blocks() {
            self.store.block_remaining(&sig.block_key(client_key)).await?
        } else {
            None
        };

        let window = self.store.peek(&sig.counter_key(client_key)).await?;
        let (consumed, window_remaining) = window
            .map(|w| (w.count, w.remaining))
            .unwrap_or((0, Duration::ZERO));

        Ok(LimiterStatus {
            consumed,
            remaining: remaining_points(sig.points, consumed),
            window_remaining,
            blocked_for,
        })
    }

    /// Forget the window counter and block marker of `client_key`.
    pub async fn reset(&self, client_key: &str) -> Result<()> {
        let sig = &self.signature;
        self.store.delete(&sig.counter_key(client_key)).await?;
        self.store.delete(&sig.block_key(client_key)).await?;
        debug!(prefix = %sig.key_prefix, key = %client_key, "Reset client limits");
        Ok(())
    }

    fn denied(&self, consumed: u64, wait: Duration, blocked: bool) -> RateLimitDecision {
        RateLimitDecision {
            allowed: false,
            limit: self.signature.points,
            consumed,
            remaining: 0,
            ms_before_next: as_millis(wait),
            blocked,
        }
    }
}

fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn remaining_points(points: u32, consumed: u64) -> u32 {
    u64::from(points).saturating_sub(consumed) as u32
}
