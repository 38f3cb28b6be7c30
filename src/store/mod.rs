//! State store adapter.
//!
//! The only layer that talks to the backing key/value store. Quota state
//! is touched exclusively through [`StateStore::eval_script`], which runs a
//! whole read-modify-write step as one atomic operation per key.

mod memory;
mod redis;
mod scripts;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::{Result, ThrottlexError};
use crate::ratelimit::Clock;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;
pub use scripts::{QuotaScript, ScriptCall, ScriptHandle, ScriptReply, TOKEN_BUCKET_TTL_SECONDS};

/// Primitives the decision core needs from the backing store.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read a string record.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a string record, replacing any previous value.
    async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<()>;

    /// Remove a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn set_add(&self, key: &str, member: &str) -> Result<()>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<()>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Read one field of a hash record.
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Register a quota script and return its handle.
    async fn load_script(&self, script: QuotaScript) -> Result<ScriptHandle>;

    /// Run a registered script atomically against the call's key.
    ///
    /// Fails with [`ThrottlexError::UnknownScript`](crate::error::ThrottlexError::UnknownScript)
    /// when the store does not know `handle`.
    async fn eval_script(&self, handle: &ScriptHandle, call: &ScriptCall) -> Result<ScriptReply>;

    /// Round-trip liveness check.
    async fn ping(&self) -> Result<()>;
}

/// Build the configured store.
pub async fn connect(config: &StoreConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn StateStore>> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-memory state store");
            Ok(Arc::new(MemoryStore::new(clock)))
        }
        StoreBackend::Redis => {
            let store = RedisStore::connect(&config.redis_url, config.timeout()).await?;
            Ok(Arc::new(store))
        }
    }
}

/// Run one store round trip, failing with
/// [`ThrottlexError::Timeout`] once `timeout` elapses.
pub async fn bounded<T, E, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    ThrottlexError: From<E>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ThrottlexError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_slow_round_trip_times_out() {
        let timeout = Duration::from_millis(1);
        let err = bounded(timeout, std::future::pending::<Result<()>>())
            .await
            .unwrap_err();
        assert!(matches!(err, ThrottlexError::Timeout(t) if t == timeout));
        assert!(err.is_backend_unavailable());
    }

    #[tokio::test]
    async fn test_fast_round_trip_passes_through() {
        let value = bounded(Duration::from_secs(1), async { Ok::<_, ThrottlexError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);

        let err = bounded(Duration::from_secs(1), async {
            Err::<(), _>(ThrottlexError::Backend("refused".to_string()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ThrottlexError::Backend(_)));
    }
}
