//! The decision facade the request-handling layer calls.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::clock::{Clock, SystemClock};
use super::fixed_window::FixedWindowEvaluator;
use super::mutator::AtomicStateMutator;
use super::observer::{DecisionEvent, DecisionObserver, TracingObserver};
use super::policies::PolicyRepository;
use super::policy::{Decision, DefaultPolicy, EvaluateRequest, Policy, Quota};
use super::resolver::PolicyResolver;
use super::token_bucket::TokenBucketEvaluator;
use crate::error::{Result, ThrottlexError};
use crate::store::StateStore;

/// Tokens taken from a bucket per request.
const TOKENS_PER_REQUEST: u64 = 1;

/// What to do when the state store is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Admit the request without a quota check
    Open,
    /// Surface the backend error to the caller
    Closed,
}

/// `X-RateLimit-*` header values for a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
    /// `limit + burst`
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: i64,
}

impl RateLimitHeaders {
    pub const LIMIT: &'static str = "X-RateLimit-Limit";
    pub const REMAINING: &'static str = "X-RateLimit-Remaining";
    pub const RESET: &'static str = "X-RateLimit-Reset";

    /// Unknown values (fail-open admits) are reported as 0.
    pub fn new(policy: &Policy, decision: &Decision) -> Self {
        Self {
            limit: policy.effective_limit(),
            remaining: decision.remaining.unwrap_or(0),
            reset_at: decision.reset_at.unwrap_or(0),
        }
    }

    pub fn pairs(&self) -> [(&'static str, String); 3] {
        [
            (Self::LIMIT, self.limit.to_string()),
            (Self::REMAINING, self.remaining.to_string()),
            (Self::RESET, self.reset_at.to_string()),
        ]
    }
}

/// A decision and the headers describing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub decision: Decision,
    pub headers: RateLimitHeaders,
}

/// Settings injected into the limiter at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterSettings {
    pub default_policy: DefaultPolicy,
    pub failure_mode: FailureMode,
}

/// Resolves the governing policy, runs its algorithm and reports the
/// outcome.
///
/// Holds no quota state and takes no locks: every evaluation is one atomic
/// operation on the store, so any number of instances may share it.
pub struct RateLimiter {
    store: Arc<dyn StateStore>,
    policies: Arc<PolicyRepository>,
    resolver: PolicyResolver,
    mutator: Arc<AtomicStateMutator>,
    fixed_window: FixedWindowEvaluator,
    token_bucket: TokenBucketEvaluator,
    settings: LimiterSettings,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn DecisionObserver>,
}

impl RateLimiter {
    /// Create a limiter on the system clock that logs decisions.
    pub fn new(store: Arc<dyn StateStore>, settings: LimiterSettings) -> Self {
        let policies = Arc::new(PolicyRepository::new(store.clone()));
        let mutator = Arc::new(AtomicStateMutator::new(store.clone()));

        Self {
            resolver: PolicyResolver::new(policies.clone()),
            fixed_window: FixedWindowEvaluator::new(mutator.clone(), store.clone()),
            token_bucket: TokenBucketEvaluator::new(mutator.clone(), store.clone()),
            store,
            policies,
            mutator,
            settings,
            clock: Arc::new(SystemClock),
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn DecisionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Register the quota scripts with the store ahead of the first request.
    pub async fn register_scripts(&self) -> Result<()> {
        self.mutator.register_all().await
    }

    /// Decide whether `request` is admitted.
    ///
    /// Store failures follow the configured [`FailureMode`].
    pub async fn evaluate(&self, request: &EvaluateRequest) -> Result<Evaluation> {
        let started = Instant::now();
        let now = self.clock.now();

        let (policy, default_policy) =
            match self.resolver.resolve(&request.tenant_id, &request.route).await {
                Ok(Some(policy)) => (policy, false),
                Ok(None) => {
                    warn!(
                        tenant_id = %request.tenant_id,
                        route = %request.route,
                        "No policy found, using default"
                    );
                    (self.settings.default_policy.policy_for(request), true)
                }
                Err(e) => {
                    let policy = self.settings.default_policy.policy_for(request);
                    return self.on_store_failure(request, &policy, true, started, e);
                }
            };

        let decision = match self.dispatch(&policy, request, now).await {
            Ok(decision) => decision,
            Err(e) => {
                return self.on_store_failure(request, &policy, default_policy, started, e)
            }
        };

        debug!(
            tenant_id = %request.tenant_id,
            route = %request.route,
            allow = decision.allow,
            remaining = ?decision.remaining,
            "Decision made"
        );

        Ok(self.finish(request, &policy, decision, default_policy, false, started))
    }

    /// The single point where an algorithm is chosen.
    async fn dispatch(&self, policy: &Policy, request: &EvaluateRequest, now: i64) -> Result<Decision> {
        match policy.quota() {
            Quota::FixedWindow(params) => {
                self.fixed_window
                    .evaluate(
                        &request.tenant_id,
                        &request.route,
                        params.limit,
                        params.window_seconds,
                        params.burst,
                        now,
                    )
                    .await
            }
            Quota::TokenBucket(params) => {
                self.token_bucket
                    .evaluate(
                        &request.tenant_id,
                        &request.route,
                        params.capacity,
                        params.refill_rate_per_sec,
                        TOKENS_PER_REQUEST,
                        now,
                    )
                    .await
            }
        }
    }

    fn on_store_failure(
        &self,
        request: &EvaluateRequest,
        policy: &Policy,
        default_policy: bool,
        started: Instant,
        err: ThrottlexError,
    ) -> Result<Evaluation> {
        if !err.is_backend_unavailable() {
            return Err(err);
        }

        match self.settings.failure_mode {
            FailureMode::Closed => {
                error!(
                    tenant_id = %request.tenant_id,
                    route = %request.route,
                    error = %err,
                    "State store unavailable, failing closed"
                );
                Err(err)
            }
            FailureMode::Open => {
                warn!(
                    tenant_id = %request.tenant_id,
                    route = %request.route,
                    error = %err,
                    "State store unavailable, failing open"
                );
                Ok(self.finish(
                    request,
                    policy,
                    Decision::unmetered(),
                    default_policy,
                    true,
                    started,
                ))
            }
        }
    }

    fn finish(
        &self,
        request: &EvaluateRequest,
        policy: &Policy,
        decision: Decision,
        default_policy: bool,
        fail_open: bool,
        started: Instant,
    ) -> Evaluation {
        let headers = RateLimitHeaders::new(policy, &decision);

        self.observer.on_decision(&DecisionEvent {
            tenant_id: request.tenant_id.clone(),
            route: request.route.clone(),
            algorithm: policy.algorithm,
            decision,
            default_policy,
            fail_open,
            elapsed: started.elapsed(),
        });

        Evaluation { decision, headers }
    }

    /// Create or replace a policy.
    pub async fn create_policy(&self, policy: &Policy) -> Result<Policy> {
        policy.validate()?;
        let saved = self.policies.save(policy).await?;
        self.observer.on_policy_saved(&saved);
        Ok(saved)
    }

    pub async fn list_policies(&self, tenant_id: &str) -> Result<Vec<Policy>> {
        self.policies.list(tenant_id).await
    }

    /// Returns whether a record existed.
    pub async fn delete_policy(&self, tenant_id: &str, route: Option<&str>) -> Result<bool> {
        self.policies.delete(tenant_id, route).await
    }

    /// Requests counted in the current fixed window of a tenant/route.
    pub async fn window_count(&self, tenant_id: &str, route: &str, window_seconds: u64) -> Result<u64> {
        self.fixed_window
            .current_count(tenant_id, route, window_seconds, self.clock.now())
            .await
    }

    /// Tokens left in a tenant/route bucket.
    pub async fn bucket_tokens(&self, tenant_id: &str, route: &str, capacity: u64) -> Result<u64> {
        self.token_bucket.tokens(tenant_id, route, capacity).await
    }

    /// Refill a tenant/route bucket to capacity.
    pub async fn reset_bucket(&self, tenant_id: &str, route: &str) -> Result<()> {
        self.token_bucket.reset(tenant_id, route).await
    }

    /// Whether the state store answers.
    pub async fn health_check(&self) -> bool {
        match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "State store health check failed");
                false
            }
        }
    }
}
