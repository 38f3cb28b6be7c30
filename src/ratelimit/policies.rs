//! Policy records in the state store.
//!
//! Layout:
//! - `policy:{tenant}:{route}` / `policy:{tenant}:*` hold the JSON record
//! - `policies:{tenant}` is the set of a tenant's record keys, for listing

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use super::policy::Policy;
use crate::error::{Result, ThrottlexError};
use crate::store::StateStore;

/// Create, list, read and delete policy records.
pub struct PolicyRepository {
    store: Arc<dyn StateStore>,
}

impl PolicyRepository {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    fn index_key(tenant_id: &str) -> String {
        format!("policies:{}", tenant_id)
    }

    /// Store `policy`, replacing any record under the same key.
    pub async fn save(&self, policy: &Policy) -> Result<Policy> {
        let key = policy.key();
        let record = serde_json::to_string(policy)?;

        self.store.set(&key, &record, policy.ttl_seconds).await?;
        self.store
            .set_add(&Self::index_key(&policy.tenant_id), &key)
            .await?;

        info!(
            tenant_id = %policy.tenant_id,
            route = ?policy.route,
            algorithm = %policy.algorithm,
            limit = policy.limit,
            "Policy saved"
        );
        Ok(policy.clone())
    }

    /// Read the record stored under `key`.
    pub async fn get(&self, key: &str) -> Result<Option<Policy>> {
        match self.store.get(key).await? {
            Some(record) => Ok(Some(serde_json::from_str(&record)?)),
            None => Ok(None),
        }
    }

    /// All live policies of a tenant. Expired records are skipped.
    pub async fn list(&self, tenant_id: &str) -> Result<Vec<Policy>> {
        let keys = self.store.set_members(&Self::index_key(tenant_id)).await?;
        let mut policies = Vec::with_capacity(keys.len());

        for key in keys {
            match self.get(&key).await? {
                Some(policy) => policies.push(policy),
                None => debug!(key = %key, "Listed policy has expired"),
            }
        }

        Ok(policies)
    }

    /// Delete the route policy, or the tenant-wide one when `route` is `None`.
    ///
    /// Returns whether a record existed.
    pub async fn delete(&self, tenant_id: &str, route: Option<&str>) -> Result<bool> {
        let key = Policy::key_for(tenant_id, route);
        let deleted = self.store.delete(&key).await?;
        self.store
            .set_remove(&Self::index_key(tenant_id), &key)
            .await?;

        info!(
            tenant_id = %tenant_id,
            route = ?route,
            deleted = deleted,
            "Policy deleted"
        );
        Ok(deleted)
    }
}

/// Load a YAML list of policies, e.g. for seeding at startup.
pub fn load_seed_file<P: AsRef<Path>>(path: P) -> Result<Vec<Policy>> {
    let path = path.as_ref();
    info!(path = %path.display(), "Loading seed policies");

    let contents = std::fs::read_to_string(path)?;
    parse_seed_yaml(&contents)
}

/// Parse and validate a YAML list of policies.
pub fn parse_seed_yaml(yaml: &str) -> Result<Vec<Policy>> {
    let policies: Vec<Policy> = serde_yaml::from_str(yaml)
        .map_err(|e| ThrottlexError::Config(format!("Failed to parse seed policies: {}", e)))?;

    for policy in &policies {
        policy.validate().map_err(|e| {
            ThrottlexError::Config(format!("Invalid seed policy {}: {}", policy.key(), e))
        })?;
    }

    Ok(policies)
}
