//! Token bucket with continuous refill.
//!
//! Refill is `floor(elapsed * rate)` and `last_refill` moves to `now` on
//! every call, so fractional accrual below one token is dropped between
//! calls. At low rates a steady trickle of requests can therefore see less
//! refill than the nominal rate.

use std::sync::Arc;

use tracing::trace;

use super::mutator::AtomicStateMutator;
use super::policy::Decision;
use crate::error::Result;
use crate::store::{ScriptCall, ScriptReply, StateStore};

/// Persisted bucket record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    pub tokens: u64,
    /// Epoch seconds of the last mutation
    pub last_refill: i64,
}

impl BucketState {
    /// Decode the `tokens` / `last_refill` hash fields. Partial or
    /// unparsable records count as absent.
    pub fn from_fields(tokens: Option<&str>, last_refill: Option<&str>) -> Option<Self> {
        let tokens = tokens?.parse::<f64>().ok()?;
        let last_refill = last_refill?.parse::<f64>().ok()?;
        Some(Self {
            tokens: tokens.max(0.0) as u64,
            last_refill: last_refill as i64,
        })
    }
}

/// Result of one bucket transition. The state is persisted either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketStep {
    pub state: BucketState,
    pub reply: ScriptReply,
}

/// The bucket state transition, identical to the server-side script.
pub fn step(
    state: Option<BucketState>,
    capacity: u64,
    refill_rate: f64,
    requested: u64,
    now: i64,
) -> BucketStep {
    let BucketState {
        tokens,
        last_refill,
    } = state.unwrap_or(BucketState {
        tokens: capacity,
        last_refill: now,
    });

    let elapsed = now.saturating_sub(last_refill).max(0) as f64;
    let refill = (elapsed * refill_rate).floor() as u64;
    let tokens = capacity.min(tokens.saturating_add(refill));

    if tokens >= requested {
        let tokens = tokens - requested;
        BucketStep {
            state: BucketState {
                tokens,
                last_refill: now,
            },
            reply: ScriptReply {
                allowed: true,
                remaining: tokens,
                reset_at: 0,
            },
        }
    } else {
        // Float to int casts saturate, so a zero or tiny rate waits until i64::MAX.
        let wait = ((requested - tokens) as f64 / refill_rate).ceil() as i64;
        BucketStep {
            state: BucketState {
                tokens,
                last_refill: now,
            },
            reply: ScriptReply {
                allowed: false,
                remaining: tokens,
                reset_at: now.saturating_add(wait),
            },
        }
    }
}

/// Bucket key: `tokenbucket:{tenant}:{route}`.
pub fn bucket_key(tenant_id: &str, route: &str) -> String {
    format!("tokenbucket:{}:{}", tenant_id, route)
}

/// Evaluates token-bucket quotas against the state store.
pub struct TokenBucketEvaluator {
    mutator: Arc<AtomicStateMutator>,
    store: Arc<dyn StateStore>,
}

impl TokenBucketEvaluator {
    pub fn new(mutator: Arc<AtomicStateMutator>, store: Arc<dyn StateStore>) -> Self {
        Self { mutator, store }
    }

    /// Try to take `tokens_requested` tokens from the bucket.
    ///
    /// An admitted request reports `reset_at = 0`: no wait is needed.
    pub async fn evaluate(
        &self,
        tenant_id: &str,
        route: &str,
        capacity: u64,
        refill_rate_per_sec: f64,
        tokens_requested: u64,
        now: i64,
    ) -> Result<Decision> {
        let call = ScriptCall::TokenBucket {
            key: bucket_key(tenant_id, route),
            capacity,
            refill_rate: refill_rate_per_sec,
            now,
            requested: tokens_requested,
        };

        let reply = self.mutator.apply(&call).await?;

        trace!(
            tenant_id = %tenant_id,
            route = %route,
            allow = reply.allowed,
            remaining = reply.remaining,
            "Token bucket evaluated"
        );

        Ok(if reply.allowed {
            Decision::allowed(reply.remaining, reply.reset_at)
        } else {
            Decision::blocked(reply.remaining, reply.reset_at)
        })
    }

    /// Stored token count, or `capacity` for a bucket never touched.
    pub async fn tokens(&self, tenant_id: &str, route: &str, capacity: u64) -> Result<u64> {
        let tokens = self
            .store
            .hash_get(&bucket_key(tenant_id, route), "tokens")
            .await?;
        Ok(tokens
            .and_then(|t| t.parse::<f64>().ok())
            .map(|t| t.max(0.0) as u64)
            .unwrap_or(capacity))
    }

    /// Drop the bucket so the next call starts full.
    pub async fn reset(&self, tenant_id: &str, route: &str) -> Result<()> {
        self.store.delete(&bucket_key(tenant_id, route)).await?;
        Ok(())
    }
}
