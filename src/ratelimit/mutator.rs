//! Atomic quota mutations with cached script handles.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Result, ThrottlexError};
use crate::store::{QuotaScript, ScriptCall, ScriptHandle, ScriptReply, StateStore};

/// Applies quota scripts as single indivisible store operations.
///
/// Handles are cached after first registration. When the store reports a
/// handle unknown (its script cache was flushed) the script is registered
/// again and the call retried exactly once; a second miss surfaces as a
/// backend error.
pub struct AtomicStateMutator {
    store: Arc<dyn StateStore>,
    handles: RwLock<HashMap<QuotaScript, ScriptHandle>>,
}

impl AtomicStateMutator {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Register every quota script up front.
    pub async fn register_all(&self) -> Result<()> {
        for script in QuotaScript::ALL {
            self.register(script).await?;
        }
        info!(scripts = ?QuotaScript::ALL.map(|s| s.name()), "Quota scripts loaded");
        Ok(())
    }

    /// Run `call` atomically and return the script's reply.
    pub async fn apply(&self, call: &ScriptCall) -> Result<ScriptReply> {
        let script = call.script();
        let handle = self.handle(script).await?;

        match self.store.eval_script(&handle, call).await {
            Err(ThrottlexError::UnknownScript(sha)) => {
                warn!(script = script.name(), sha = %sha, "Script unknown to store, reloading");
                let handle = self.register(script).await?;
                match self.store.eval_script(&handle, call).await {
                    Err(ThrottlexError::UnknownScript(sha)) => Err(ThrottlexError::Backend(
                        format!("script {} still unknown after reload", sha),
                    )),
                    other => other,
                }
            }
            other => other,
        }
    }

    /// The cached handle for `script`, registering it on first use.
    async fn handle(&self, script: QuotaScript) -> Result<ScriptHandle> {
        let cached = self.handles.read().get(&script).cloned();
        match cached {
            Some(handle) => Ok(handle),
            None => self.register(script).await,
        }
    }

    async fn register(&self, script: QuotaScript) -> Result<ScriptHandle> {
        let handle = self.store.load_script(script).await?;
        debug!(script = script.name(), sha = %handle, "Script handle cached");
        self.handles.write().insert(script, handle.clone());
        Ok(handle)
    }
}
