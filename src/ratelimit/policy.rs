//! Policy data model and the evaluation request/decision values.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ThrottlexError};

/// Longest accepted tenant identifier.
pub const MAX_TENANT_ID_LEN: usize = 255;
/// Longest accepted route.
pub const MAX_ROUTE_LEN: usize = 500;
/// Largest accepted `limit`.
pub const MAX_LIMIT: u64 = 1_000_000_000;
/// Largest accepted `burst`.
pub const MAX_BURST: u64 = 1_000_000_000;
/// Largest accepted window, one year.
pub const MAX_WINDOW_SECONDS: u64 = 31_536_000;
/// Largest accepted policy record TTL, ten years.
pub const MAX_TTL_SECONDS: u64 = 315_360_000;

/// Whether a policy applies to the whole tenant or to one route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scope {
    /// Tenant-wide; every route still keys its own quota state
    Tenant,
    /// Narrowed to a single route
    TenantRoute,
}

/// Quota algorithm named by a policy record.
///
/// The fixed-window counter is stored under its external name
/// `SLIDING_WINDOW`; `FIXED_WINDOW` is accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "SLIDING_WINDOW", alias = "FIXED_WINDOW")]
    FixedWindow,
    #[serde(rename = "TOKEN_BUCKET")]
    TokenBucket,
}

impl Algorithm {
    /// Stable label used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "SLIDING_WINDOW",
            Algorithm::TokenBucket => "TOKEN_BUCKET",
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A quota rule for a tenant, optionally narrowed to one route.
///
/// Records are replaced whole, never patched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub tenant_id: String,
    #[serde(default)]
    pub route: Option<String>,
    pub scope: Scope,
    pub algorithm: Algorithm,
    pub limit: u64,
    pub window_seconds: u64,
    #[serde(default)]
    pub burst: u64,
    /// TTL of the policy record itself, not of any quota state
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

/// Fixed-window parameters derived from a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindowParams {
    pub limit: u64,
    pub window_seconds: u64,
    pub burst: u64,
}

/// Token-bucket parameters derived from a policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketParams {
    pub capacity: u64,
    pub refill_rate_per_sec: f64,
}

/// The algorithm of a policy together with its parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Quota {
    FixedWindow(FixedWindowParams),
    TokenBucket(TokenBucketParams),
}

impl Policy {
    /// Storage key of this record: `policy:{tenant}:{route or *}`.
    pub fn key(&self) -> String {
        Self::key_for(&self.tenant_id, self.route.as_deref())
    }

    /// Storage key for a tenant and an optional route.
    pub fn key_for(tenant_id: &str, route: Option<&str>) -> String {
        match route {
            Some(route) if !route.is_empty() => format!("policy:{}:{}", tenant_id, route),
            _ => format!("policy:{}:*", tenant_id),
        }
    }

    /// `limit + burst`, the ceiling reported to clients.
    pub fn effective_limit(&self) -> u64 {
        self.limit.saturating_add(self.burst)
    }

    /// Resolve the algorithm into its parameter set.
    pub fn quota(&self) -> Quota {
        match self.algorithm {
            Algorithm::FixedWindow => Quota::FixedWindow(FixedWindowParams {
                limit: self.limit,
                window_seconds: self.window_seconds,
                burst: self.burst,
            }),
            Algorithm::TokenBucket => Quota::TokenBucket(TokenBucketParams {
                capacity: self.effective_limit(),
                refill_rate_per_sec: self.limit as f64 / self.window_seconds as f64,
            }),
        }
    }

    /// Check field ranges and the scope/route invariant.
    pub fn validate(&self) -> Result<()> {
        validate_tenant_id(&self.tenant_id)?;

        if let Some(route) = &self.route {
            if route.is_empty() {
                return Err(invalid("route must not be empty when present"));
            }
            if route.chars().count() > MAX_ROUTE_LEN {
                return Err(invalid(format!(
                    "route must be at most {} characters",
                    MAX_ROUTE_LEN
                )));
            }
        }

        match (self.scope, &self.route) {
            (Scope::TenantRoute, None) => {
                return Err(invalid("scope TENANT_ROUTE requires a route"));
            }
            (Scope::Tenant, Some(_)) => {
                return Err(invalid("scope TENANT applies to every route and must not name one"));
            }
            _ => {}
        }

        if !(1..=MAX_LIMIT).contains(&self.limit) {
            return Err(invalid(format!("limit must be between 1 and {}", MAX_LIMIT)));
        }
        if self.burst > MAX_BURST {
            return Err(invalid(format!("burst must be at most {}", MAX_BURST)));
        }
        if !(1..=MAX_WINDOW_SECONDS).contains(&self.window_seconds) {
            return Err(invalid(format!(
                "windowSeconds must be between 1 and {}",
                MAX_WINDOW_SECONDS
            )));
        }
        if let Some(ttl) = self.ttl_seconds {
            if !(1..=MAX_TTL_SECONDS).contains(&ttl) {
                return Err(invalid(format!(
                    "ttlSeconds must be between 1 and {}",
                    MAX_TTL_SECONDS
                )));
            }
        }

        Ok(())
    }
}

/// Process-configured policy applied when nothing matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultPolicy {
    pub algorithm: Algorithm,
    pub limit: u64,
    pub window_seconds: u64,
}

impl DefaultPolicy {
    /// Build the ephemeral policy for a request. Never stored.
    pub fn policy_for(&self, request: &EvaluateRequest) -> Policy {
        Policy {
            tenant_id: request.tenant_id.clone(),
            route: Some(request.route.clone()),
            scope: Scope::TenantRoute,
            algorithm: self.algorithm,
            limit: self.limit,
            window_seconds: self.window_seconds,
            burst: 0,
            ttl_seconds: None,
        }
    }
}

/// Inbound evaluation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateRequest {
    pub tenant_id: String,
    pub route: String,
}

impl EvaluateRequest {
    pub fn new(tenant_id: impl Into<String>, route: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            route: route.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_tenant_id(&self.tenant_id)?;
        if self.route.is_empty() {
            return Err(invalid("route must not be empty"));
        }
        Ok(())
    }
}

/// Outcome of one evaluation. Built fresh on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allow: bool,
    pub remaining: Option<u64>,
    /// Epoch seconds at which capacity is next expected
    pub reset_at: Option<i64>,
}

impl Decision {
    pub fn allowed(remaining: u64, reset_at: i64) -> Self {
        Self {
            allow: true,
            remaining: Some(remaining),
            reset_at: Some(reset_at),
        }
    }

    pub fn blocked(remaining: u64, reset_at: i64) -> Self {
        Self {
            allow: false,
            remaining: Some(remaining),
            reset_at: Some(reset_at),
        }
    }

    /// Admit without consulting quota state.
    pub fn unmetered() -> Self {
        Self {
            allow: true,
            remaining: None,
            reset_at: None,
        }
    }
}

fn validate_tenant_id(tenant_id: &str) -> Result<()> {
    if tenant_id.is_empty() {
        return Err(invalid("tenantId must not be empty"));
    }
    if tenant_id.chars().count() > MAX_TENANT_ID_LEN {
        return Err(invalid(format!(
            "tenantId must be at most {} characters",
            MAX_TENANT_ID_LEN
        )));
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> ThrottlexError {
    ThrottlexError::Validation(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(scope: Scope, route: Option<&str>, algorithm: Algorithm) -> Policy {
        Policy {
            tenant_id: "acme".to_string(),
            route: route.map(str::to_string),
            scope,
            algorithm,
            limit: 10,
            window_seconds: 60,
            burst: 5,
            ttl_seconds: None,
        }
    }

    #[test]
    fn test_policy_key() {
        let route = policy(Scope::TenantRoute, Some("/orders"), Algorithm::FixedWindow);
        assert_eq!(route.key(), "policy:acme:/orders");

        let tenant = policy(Scope::Tenant, None, Algorithm::FixedWindow);
        assert_eq!(tenant.key(), "policy:acme:*");
    }

    #[test]
    fn test_quota_parameters() {
        let fixed = policy(Scope::Tenant, None, Algorithm::FixedWindow);
        assert_eq!(
            fixed.quota(),
            Quota::FixedWindow(FixedWindowParams {
                limit: 10,
                window_seconds: 60,
                burst: 5
            })
        );

        let bucket = policy(Scope::Tenant, None, Algorithm::TokenBucket);
        match bucket.quota() {
            Quota::TokenBucket(params) => {
                assert_eq!(params.capacity, 15);
                assert!((params.refill_rate_per_sec - 10.0 / 60.0).abs() < f64::EPSILON);
            }
            other => panic!("unexpected quota {:?}", other),
        }
    }

    #[test]
    fn test_policy_json_shape() {
        let json = r#"{
            "tenantId": "acme",
            "route": "/orders",
            "scope": "TENANT_ROUTE",
            "algorithm": "SLIDING_WINDOW",
            "limit": 100,
            "windowSeconds": 60
        }"#;
        let parsed: Policy = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.algorithm, Algorithm::FixedWindow);
        assert_eq!(parsed.burst, 0);
        assert_eq!(parsed.ttl_seconds, None);

        let encoded = serde_json::to_value(&parsed).unwrap();
        assert_eq!(encoded["tenantId"], "acme");
        assert_eq!(encoded["windowSeconds"], 60);
        assert_eq!(encoded["algorithm"], "SLIDING_WINDOW");
    }

    #[test]
    fn test_fixed_window_alias_accepted() {
        let json = r#"{"tenantId":"t","scope":"TENANT","algorithm":"FIXED_WINDOW","limit":1,"windowSeconds":1}"#;
        let parsed: Policy = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.algorithm, Algorithm::FixedWindow);
    }

    #[test]
    fn test_validation_rejects_bad_policies() {
        let mut p = policy(Scope::TenantRoute, None, Algorithm::FixedWindow);
        assert!(matches!(p.validate(), Err(ThrottlexError::Validation(_))));

        p = policy(Scope::Tenant, Some("/x"), Algorithm::FixedWindow);
        assert!(p.validate().is_err());

        p = policy(Scope::Tenant, None, Algorithm::FixedWindow);
        p.limit = 0;
        assert!(p.validate().is_err());

        p = policy(Scope::Tenant, None, Algorithm::FixedWindow);
        p.window_seconds = 0;
        assert!(p.validate().is_err());

        p = policy(Scope::Tenant, None, Algorithm::FixedWindow);
        p.tenant_id = "x".repeat(MAX_TENANT_ID_LEN + 1);
        assert!(p.validate().is_err());

        p = policy(Scope::TenantRoute, Some(&"r".repeat(MAX_ROUTE_LEN + 1)), Algorithm::TokenBucket);
        assert!(p.validate().is_err());

        p = policy(Scope::Tenant, None, Algorithm::FixedWindow);
        p.ttl_seconds = Some(0);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_out_of_range_quantities() {
        let mut p = policy(Scope::Tenant, None, Algorithm::FixedWindow);
        p.limit = u64::MAX;
        assert!(matches!(p.validate(), Err(ThrottlexError::Validation(_))));

        p = policy(Scope::Tenant, None, Algorithm::FixedWindow);
        p.burst = u64::MAX;
        assert!(p.validate().is_err());

        p = policy(Scope::Tenant, None, Algorithm::FixedWindow);
        p.window_seconds = u64::MAX;
        assert!(p.validate().is_err());

        p = policy(Scope::Tenant, None, Algorithm::TokenBucket);
        p.window_seconds = i64::MAX as u64;
        assert!(p.validate().is_err());

        p = policy(Scope::Tenant, None, Algorithm::FixedWindow);
        p.ttl_seconds = Some(u64::MAX);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_validation_accepts_upper_bounds() {
        let mut p = policy(Scope::Tenant, None, Algorithm::TokenBucket);
        p.limit = MAX_LIMIT;
        p.burst = MAX_BURST;
        p.window_seconds = MAX_WINDOW_SECONDS;
        p.ttl_seconds = Some(MAX_TTL_SECONDS);
        assert!(p.validate().is_ok());
        assert_eq!(p.effective_limit(), MAX_LIMIT + MAX_BURST);
    }

    #[test]
    fn test_validation_accepts_good_policy() {
        let p = policy(Scope::TenantRoute, Some("/orders"), Algorithm::TokenBucket);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_evaluate_request_validation() {
        assert!(EvaluateRequest::new("acme", "/x").validate().is_ok());
        assert!(EvaluateRequest::new("", "/x").validate().is_err());
        assert!(EvaluateRequest::new("acme", "").validate().is_err());
    }

    #[test]
    fn test_default_policy_is_route_scoped() {
        let defaults = DefaultPolicy {
            algorithm: Algorithm::TokenBucket,
            limit: 100,
            window_seconds: 60,
        };
        let p = defaults.policy_for(&EvaluateRequest::new("acme", "/x"));
        assert_eq!(p.scope, Scope::TenantRoute);
        assert_eq!(p.route.as_deref(), Some("/x"));
        assert_eq!(p.burst, 0);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_decision_serializes_camel_case() {
        let value = serde_json::to_value(Decision::allowed(4, 1_700_000_060)).unwrap();
        assert_eq!(value["allow"], true);
        assert_eq!(value["remaining"], 4);
        assert_eq!(value["resetAt"], 1_700_000_060i64);

        let value = serde_json::to_value(Decision::unmetered()).unwrap();
        assert!(value["remaining"].is_null());
        assert!(value["resetAt"].is_null());
    }
}
