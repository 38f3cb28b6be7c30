//! Single-process state store backed by a concurrent hash map.
//!
//! Every mutation of a key runs while holding that key's shard lock, so a
//! quota script is as indivisible here as it is on Redis. TTLs are measured
//! against the injected clock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tracing::debug;

use super::scripts::{QuotaScript, ScriptCall, ScriptHandle, ScriptReply, TOKEN_BUCKET_TTL_SECONDS};
use super::StateStore;
use crate::error::{Result, ThrottlexError};
use crate::ratelimit::{fixed_window, token_bucket, Clock};

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    /// Epoch second at which the entry disappears
    expires_at: Option<i64>,
}

impl Entry {
    fn new(value: Value, ttl_seconds: Option<u64>, now: i64) -> Self {
        Self {
            value,
            expires_at: ttl_seconds
                .map(|ttl| now.saturating_add(i64::try_from(ttl).unwrap_or(i64::MAX))),
        }
    }

    fn is_live(&self, now: i64) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }

    fn ttl(&self, now: i64) -> Option<i64> {
        self.expires_at.map(|at| at - now)
    }
}

/// In-memory [`StateStore`].
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    entries: DashMap<String, Entry>,
    scripts: DashMap<String, QuotaScript>,
    script_loads: AtomicUsize,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: DashMap::new(),
            scripts: DashMap::new(),
            script_loads: AtomicUsize::new(0),
        }
    }

    /// Forget every registered script, like `SCRIPT FLUSH`.
    pub fn flush_scripts(&self) {
        self.scripts.clear();
    }

    /// Number of `load_script` calls served so far.
    pub fn script_loads(&self) -> usize {
        self.script_loads.load(Ordering::SeqCst)
    }

    /// Remaining TTL of a live key, in seconds.
    pub fn ttl(&self, key: &str) -> Option<i64> {
        let now = self.clock.now();
        self.entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .and_then(|entry| entry.ttl(now))
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries.iter().filter(|e| e.value().is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live(&self, key: &str) -> Option<Entry> {
        let now = self.clock.now();
        self.entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value().clone())
    }

    /// Run `f` against the live entry for `key` under its shard lock.
    ///
    /// `f` returns the entry to store, or `None` to leave the key alone.
    fn mutate<T>(&self, key: &str, f: impl FnOnce(Option<&Entry>, i64) -> (Option<Entry>, T)) -> T {
        let now = self.clock.now();
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let live = occupied.get().is_live(now);
                let (update, out) = f(live.then(|| occupied.get()), now);
                match update {
                    Some(entry) => {
                        occupied.insert(entry);
                    }
                    None if !live => {
                        occupied.remove();
                    }
                    None => {}
                }
                out
            }
            MapEntry::Vacant(vacant) => {
                let (update, out) = f(None, now);
                if let Some(entry) = update {
                    vacant.insert(entry);
                }
                out
            }
        }
    }

    fn run_fixed_window(&self, call: &ScriptCall) -> Result<ScriptReply> {
        let ScriptCall::FixedWindow {
            key,
            limit,
            window_seconds,
            now,
            burst,
        } = call
        else {
            return Err(ThrottlexError::Backend("fixed window call expected".to_string()));
        };

        self.mutate(key, |entry, store_now| {
            let (count, ttl) = match entry {
                None => (0, None),
                Some(Entry {
                    value: Value::Text(text),
                    ..
                }) => match text.parse::<u64>() {
                    Ok(count) => (count, entry.and_then(|e| e.ttl(store_now))),
                    Err(_) => return (None, Err(wrong_type(key))),
                },
                Some(_) => return (None, Err(wrong_type(key))),
            };

            let step = fixed_window::step(count, ttl, *limit, *window_seconds, *burst, *now);
            let update = step.new_count.map(|count| {
                Entry::new(
                    Value::Text(count.to_string()),
                    Some(*window_seconds),
                    store_now,
                )
            });
            (update, Ok(step.reply))
        })
    }

    fn run_token_bucket(&self, call: &ScriptCall) -> Result<ScriptReply> {
        let ScriptCall::TokenBucket {
            key,
            capacity,
            refill_rate,
            now,
            requested,
        } = call
        else {
            return Err(ThrottlexError::Backend("token bucket call expected".to_string()));
        };

        self.mutate(key, |entry, store_now| {
            let state = match entry {
                None => None,
                Some(Entry {
                    value: Value::Hash(fields),
                    ..
                }) => token_bucket::BucketState::from_fields(
                    fields.get("tokens").map(String::as_str),
                    fields.get("last_refill").map(String::as_str),
                ),
                Some(_) => return (None, Err(wrong_type(key))),
            };

            let step = token_bucket::step(state, *capacity, *refill_rate, *requested, *now);
            let fields = HashMap::from([
                ("tokens".to_string(), step.state.tokens.to_string()),
                ("last_refill".to_string(), step.state.last_refill.to_string()),
            ]);
            let update = Entry::new(
                Value::Hash(fields),
                Some(TOKEN_BUCKET_TTL_SECONDS),
                store_now,
            );
            (Some(update), Ok(step.reply))
        })
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.entries.len())
            .field("scripts", &self.scripts.len())
            .finish()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Text(text),
                ..
            }) => Ok(Some(text)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<()> {
        self.mutate(key, |_, now| {
            let entry = Entry::new(Value::Text(value.to_string()), ttl_seconds, now);
            (Some(entry), ())
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        Ok(self
            .entries
            .remove(key)
            .map_or(false, |(_, entry)| entry.is_live(now)))
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        self.mutate(key, |entry, now| match entry {
            None => {
                let set = HashSet::from([member.to_string()]);
                (Some(Entry::new(Value::Set(set), None, now)), Ok(()))
            }
            Some(Entry {
                value: Value::Set(set),
                expires_at,
            }) => {
                let mut set = set.clone();
                set.insert(member.to_string());
                let entry = Entry {
                    value: Value::Set(set),
                    expires_at: *expires_at,
                };
                (Some(entry), Ok(()))
            }
            Some(_) => (None, Err(wrong_type(key))),
        })
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let emptied = self.mutate(key, |entry, _| match entry {
            None => (None, Ok(false)),
            Some(Entry {
                value: Value::Set(set),
                expires_at,
            }) => {
                let mut set = set.clone();
                set.remove(member);
                let emptied = set.is_empty();
                let entry = Entry {
                    value: Value::Set(set),
                    expires_at: *expires_at,
                };
                (Some(entry), Ok(emptied))
            }
            Some(_) => (None, Err(wrong_type(key))),
        })?;

        // Redis drops empty sets.
        if emptied {
            self.entries
                .remove_if(key, |_, entry| matches!(&entry.value, Value::Set(s) if s.is_empty()));
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        match self.live(key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => {
                let mut members: Vec<String> = set.into_iter().collect();
                members.sort();
                Ok(members)
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(fields),
                ..
            }) => Ok(fields.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn load_script(&self, script: QuotaScript) -> Result<ScriptHandle> {
        let handle = script.handle();
        self.scripts.insert(handle.as_str().to_string(), script);
        self.script_loads.fetch_add(1, Ordering::SeqCst);
        debug!(script = script.name(), sha = %handle, "Registered script");
        Ok(handle)
    }

    async fn eval_script(&self, handle: &ScriptHandle, call: &ScriptCall) -> Result<ScriptReply> {
        let registered = self
            .scripts
            .get(handle.as_str())
            .map(|script| *script.value())
            .ok_or_else(|| ThrottlexError::UnknownScript(handle.to_string()))?;

        if registered != call.script() {
            return Err(ThrottlexError::Backend(format!(
                "script {} cannot run a {} call",
                handle,
                call.script().name()
            )));
        }

        match registered {
            QuotaScript::FixedWindow => self.run_fixed_window(call),
            QuotaScript::TokenBucket => self.run_token_bucket(call),
        }
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

fn wrong_type(key: &str) -> ThrottlexError {
    ThrottlexError::Backend(format!("key {} holds the wrong kind of value", key))
}
