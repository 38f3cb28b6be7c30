//! Redis-backed state store.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Cmd, ErrorKind, FromRedisValue};
use tracing::{debug, info};

use super::scripts::{QuotaScript, ScriptCall, ScriptHandle, ScriptReply};
use super::{bounded, StateStore};
use crate::error::{Result, ThrottlexError};

/// State store on a shared Redis instance.
///
/// Quota scripts run through `EVALSHA`, so each evaluation is a single
/// atomic server-side step. Every round trip is bounded by `timeout`.
#[derive(Clone)]
pub struct RedisStore {
    connection_manager: ConnectionManager,
    timeout: Duration,
}

impl RedisStore {
    /// Open a managed connection to `url` and check it answers.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::open(url)?;
        let connection_manager = bounded(timeout, client.get_connection_manager()).await?;

        let store = Self {
            connection_manager,
            timeout,
        };
        store.ping().await?;

        info!(timeout_ms = timeout.as_millis() as u64, "Connected to Redis");
        Ok(store)
    }

    async fn query<T: FromRedisValue + Send>(&self, cmd: &Cmd) -> Result<T> {
        let mut connection = self.connection_manager.clone();
        bounded(self.timeout, async move { cmd.query_async(&mut connection).await }).await
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.query(redis::cmd("GET").arg(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl_seconds {
            cmd.arg("EX").arg(ttl);
        }
        self.query(&cmd).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed: u64 = self.query(redis::cmd("DEL").arg(key)).await?;
        Ok(removed > 0)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let _: u64 = self.query(redis::cmd("SADD").arg(key).arg(member)).await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let _: u64 = self.query(redis::cmd("SREM").arg(key).arg(member)).await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        self.query(redis::cmd("SMEMBERS").arg(key)).await
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.query(redis::cmd("HGET").arg(key).arg(field)).await
    }

    async fn load_script(&self, script: QuotaScript) -> Result<ScriptHandle> {
        let sha: String = self
            .query(redis::cmd("SCRIPT").arg("LOAD").arg(script.source()))
            .await?;
        debug!(script = script.name(), sha = %sha, "Script loaded");
        Ok(ScriptHandle::new(sha))
    }

    async fn eval_script(&self, handle: &ScriptHandle, call: &ScriptCall) -> Result<ScriptReply> {
        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(handle.as_str()).arg(1).arg(call.key()).arg(call.args());

        let values: Vec<i64> = match self.query(&cmd).await {
            Ok(values) => values,
            Err(ThrottlexError::Redis(e)) if e.kind() == ErrorKind::NoScriptError => {
                return Err(ThrottlexError::UnknownScript(handle.to_string()));
            }
            Err(e) => return Err(e),
        };

        ScriptReply::from_triple(&values).ok_or_else(|| {
            ThrottlexError::Backend(format!(
                "{} script returned a malformed reply: {:?}",
                call.script().name(),
                values
            ))
        })
    }

    async fn ping(&self) -> Result<()> {
        let _: String = self.query(&redis::cmd("PING")).await?;
        Ok(())
    }
}
