//! Two-level policy lookup.

use std::sync::Arc;

use tracing::trace;

use super::policies::PolicyRepository;
use super::policy::Policy;
use crate::error::Result;

/// Finds the policy governing a tenant/route pair.
///
/// Lookup order is the exact route record, then the tenant-wide record.
/// There is no prefix or glob matching, and no default is invented here.
pub struct PolicyResolver {
    policies: Arc<PolicyRepository>,
}

impl PolicyResolver {
    pub fn new(policies: Arc<PolicyRepository>) -> Self {
        Self { policies }
    }

    pub async fn resolve(&self, tenant_id: &str, route: &str) -> Result<Option<Policy>> {
        let route_key = Policy::key_for(tenant_id, Some(route));
        if let Some(policy) = self.policies.get(&route_key).await? {
            trace!(key = %route_key, "Matched route policy");
            return Ok(Some(policy));
        }

        let tenant_key = Policy::key_for(tenant_id, None);
        let policy = self.policies.get(&tenant_key).await?;
        if policy.is_some() {
            trace!(key = %tenant_key, "Matched tenant policy");
        }
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::policy::{Algorithm, Scope};
    use crate::ratelimit::ManualClock;
    use crate::store::MemoryStore;

    fn policy(tenant: &str, route: Option<&str>, limit: u64) -> Policy {
        Policy {
            tenant_id: tenant.to_string(),
            route: route.map(str::to_string),
            scope: if route.is_some() { Scope::TenantRoute } else { Scope::Tenant },
            algorithm: Algorithm::FixedWindow,
            limit,
            window_seconds: 60,
            burst: 0,
            ttl_seconds: None,
        }
    }

    async fn resolver_with(policies: &[Policy]) -> PolicyResolver {
        let store = Arc::new(MemoryStore::new(Arc::new(ManualClock::new(0))));
        let repository = Arc::new(PolicyRepository::new(store));
        for p in policies {
            repository.save(p).await.unwrap();
        }
        PolicyResolver::new(repository)
    }

    #[tokio::test]
    async fn test_route_policy_takes_precedence() {
        let resolver = resolver_with(&[policy("t", None, 100), policy("t", Some("/x"), 5)]).await;

        let p = resolver.resolve("t", "/x").await.unwrap().unwrap();
        assert_eq!(p.limit, 5);

        let p = resolver.resolve("t", "/y").await.unwrap().unwrap();
        assert_eq!(p.limit, 100);
    }

    #[tokio::test]
    async fn test_no_policy_resolves_to_none() {
        let resolver = resolver_with(&[policy("t", Some("/x"), 5)]).await;
        assert!(resolver.resolve("t", "/y").await.unwrap().is_none());
        assert!(resolver.resolve("other", "/x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_no_prefix_matching() {
        let resolver = resolver_with(&[policy("t", Some("/api"), 5)]).await;
        assert!(resolver.resolve("t", "/api/orders").await.unwrap().is_none());
    }
}
