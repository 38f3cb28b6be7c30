//! Decision observer, notified once per finished evaluation.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::policy::{Algorithm, Decision, Policy};

/// What an observer learns about one evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionEvent {
    pub tenant_id: String,
    pub route: String,
    pub algorithm: Algorithm,
    pub decision: Decision,
    /// The configured default policy was used
    pub default_policy: bool,
    /// Admitted without a quota check because the store was unavailable
    pub fail_open: bool,
    /// Time from receiving the request to the final decision
    pub elapsed: Duration,
}

/// Receives evaluation outcomes, e.g. for logging or metrics.
///
/// Called after the decision is final; it cannot change it.
pub trait DecisionObserver: Send + Sync {
    fn on_decision(&self, event: &DecisionEvent);

    /// A policy was created or replaced.
    fn on_policy_saved(&self, _policy: &Policy) {}
}

/// Forwards every notification to each inner observer in order.
#[derive(Clone, Default)]
pub struct FanoutObserver {
    observers: Vec<Arc<dyn DecisionObserver>>,
}

impl FanoutObserver {
    pub fn new(observers: Vec<Arc<dyn DecisionObserver>>) -> Self {
        Self { observers }
    }
}

impl DecisionObserver for FanoutObserver {
    fn on_decision(&self, event: &DecisionEvent) {
        for observer in &self.observers {
            observer.on_decision(event);
        }
    }

    fn on_policy_saved(&self, policy: &Policy) {
        for observer in &self.observers {
            observer.on_policy_saved(policy);
        }
    }
}

/// Logs each decision through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl DecisionObserver for TracingObserver {
    fn on_decision(&self, event: &DecisionEvent) {
        let result = if event.decision.allow { "allowed" } else { "blocked" };

        if event.fail_open {
            warn!(
                tenant_id = %event.tenant_id,
                route = %event.route,
                "Request admitted without quota check"
            );
            return;
        }

        info!(
            tenant_id = %event.tenant_id,
            route = %event.route,
            algorithm = %event.algorithm,
            result = result,
            remaining = ?event.decision.remaining,
            reset_at = ?event.decision.reset_at,
            default_policy = event.default_policy,
            elapsed_us = event.elapsed.as_micros() as u64,
            "Request evaluated"
        );
    }
}
