//! Fixed-window counter, externally called "sliding window".
//!
//! Windows are aligned to wall-clock multiples of `window_seconds`, so this
//! is not a rolling log: a client may be admitted up to twice the effective
//! limit across a boundary (a full window just before it, another just after).

use std::sync::Arc;

use tracing::trace;

use super::mutator::AtomicStateMutator;
use super::policy::Decision;
use crate::error::Result;
use crate::store::{ScriptCall, ScriptReply, StateStore};

/// Result of one counter transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStep {
    /// New counter value to persist, `None` when the request is rejected
    pub new_count: Option<u64>,
    pub reply: ScriptReply,
}

/// The counter state transition, identical to the server-side script.
///
/// `ttl` is the remaining lifetime of the window key, `None` when the store
/// cannot report one.
pub fn step(
    count: u64,
    ttl: Option<i64>,
    limit: u64,
    window_seconds: u64,
    burst: u64,
    now: i64,
) -> WindowStep {
    let effective_limit = limit.saturating_add(burst);
    let window = seconds(window_seconds);

    if count < effective_limit {
        WindowStep {
            new_count: Some(count + 1),
            reply: ScriptReply {
                allowed: true,
                remaining: effective_limit - count - 1,
                reset_at: now.saturating_add(window),
            },
        }
    } else {
        let ttl = ttl.filter(|ttl| *ttl >= 0).unwrap_or(window);
        WindowStep {
            new_count: None,
            reply: ScriptReply {
                allowed: false,
                remaining: 0,
                reset_at: now.saturating_add(ttl),
            },
        }
    }
}

/// A second count as `i64`, saturating at `i64::MAX`.
fn seconds(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Start of the window containing `now`.
pub fn window_start(now: i64, window_seconds: u64) -> i64 {
    now - now.rem_euclid(seconds(window_seconds).max(1))
}

/// Counter key: `ratelimit:{tenant}:{route}:{window_start}`.
pub fn window_key(tenant_id: &str, route: &str, window_start: i64) -> String {
    format!("ratelimit:{}:{}:{}", tenant_id, route, window_start)
}

/// Evaluates fixed-window quotas against the state store.
pub struct FixedWindowEvaluator {
    mutator: Arc<AtomicStateMutator>,
    store: Arc<dyn StateStore>,
}

impl FixedWindowEvaluator {
    pub fn new(mutator: Arc<AtomicStateMutator>, store: Arc<dyn StateStore>) -> Self {
        Self { mutator, store }
    }

    /// Count one request against the current window.
    pub async fn evaluate(
        &self,
        tenant_id: &str,
        route: &str,
        limit: u64,
        window_seconds: u64,
        burst: u64,
        now: i64,
    ) -> Result<Decision> {
        let start = window_start(now, window_seconds);
        let call = ScriptCall::FixedWindow {
            key: window_key(tenant_id, route, start),
            limit,
            window_seconds,
            now,
            burst,
        };

        let reply = self.mutator.apply(&call).await?;

        trace!(
            tenant_id = %tenant_id,
            route = %route,
            window_start = start,
            allow = reply.allowed,
            remaining = reply.remaining,
            "Fixed window evaluated"
        );

        Ok(if reply.allowed {
            Decision::allowed(reply.remaining, reply.reset_at)
        } else {
            Decision::blocked(reply.remaining, reply.reset_at)
        })
    }

    /// Requests counted so far in the window containing `now`.
    pub async fn current_count(
        &self,
        tenant_id: &str,
        route: &str,
        window_seconds: u64,
        now: i64,
    ) -> Result<u64> {
        let key = window_key(tenant_id, route, window_start(now, window_seconds));
        let value = self.store.get(&key).await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }
}
