//! Server-side quota scripts and their typed calls.
//!
//! Each script runs the whole read-compute-write step for one key as a
//! single indivisible operation on the store.

/// Fixed-window counter.
///
/// KEYS[1] window key; ARGV: limit, window_seconds, now, burst.
/// Returns {allowed, remaining, reset_at}.
const FIXED_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local burst = tonumber(ARGV[4])

local effective_limit = limit + burst
local count = tonumber(redis.call('GET', key) or '0')

if count < effective_limit then
    redis.call('INCR', key)
    redis.call('EXPIRE', key, window)
    return {1, effective_limit - count - 1, now + window}
end

local ttl = redis.call('TTL', key)
if ttl < 0 then
    ttl = window
end
return {0, 0, now + ttl}
"#;

/// Token bucket.
///
/// KEYS[1] bucket key; ARGV: capacity, refill_rate, now, requested.
/// Returns {allowed, remaining, reset_at}; reset_at is 0 on admit.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local requested = tonumber(ARGV[4]) or 1

local bucket = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(bucket[1])
local last_refill = tonumber(bucket[2])

if tokens == nil or last_refill == nil then
    tokens = capacity
    last_refill = now
end

local elapsed = math.max(0, now - last_refill)
tokens = math.min(capacity, tokens + math.floor(elapsed * refill_rate))

if tokens >= requested then
    tokens = tokens - requested
    redis.call('HSET', key, 'tokens', tokens, 'last_refill', now)
    redis.call('EXPIRE', key, 3600)
    return {1, tokens, 0}
end

redis.call('HSET', key, 'tokens', tokens, 'last_refill', now)
redis.call('EXPIRE', key, 3600)
return {0, tokens, now + math.ceil((requested - tokens) / refill_rate)}
"#;

/// Seconds a token bucket record survives after its last mutation.
pub const TOKEN_BUCKET_TTL_SECONDS: u64 = 3600;

/// The atomic quota scripts a store must be able to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaScript {
    FixedWindow,
    TokenBucket,
}

impl QuotaScript {
    pub const ALL: [QuotaScript; 2] = [QuotaScript::FixedWindow, QuotaScript::TokenBucket];

    pub fn source(&self) -> &'static str {
        match self {
            QuotaScript::FixedWindow => FIXED_WINDOW_SCRIPT,
            QuotaScript::TokenBucket => TOKEN_BUCKET_SCRIPT,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            QuotaScript::FixedWindow => "fixed_window",
            QuotaScript::TokenBucket => "token_bucket",
        }
    }

    /// Content-derived handle: SHA1 of the source, as Redis computes it.
    pub fn handle(&self) -> ScriptHandle {
        ScriptHandle(redis::Script::new(self.source()).get_hash().to_string())
    }
}

/// Identifier a store assigns to a registered script.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptHandle(String);

impl ScriptHandle {
    pub fn new(sha: impl Into<String>) -> Self {
        Self(sha.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ScriptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One invocation of a quota script against a single key.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptCall {
    FixedWindow {
        key: String,
        limit: u64,
        window_seconds: u64,
        now: i64,
        burst: u64,
    },
    TokenBucket {
        key: String,
        capacity: u64,
        refill_rate: f64,
        now: i64,
        requested: u64,
    },
}

impl ScriptCall {
    pub fn script(&self) -> QuotaScript {
        match self {
            ScriptCall::FixedWindow { .. } => QuotaScript::FixedWindow,
            ScriptCall::TokenBucket { .. } => QuotaScript::TokenBucket,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            ScriptCall::FixedWindow { key, .. } | ScriptCall::TokenBucket { key, .. } => key,
        }
    }

    /// Positional ARGV in the order the script reads them.
    pub fn args(&self) -> Vec<String> {
        match self {
            ScriptCall::FixedWindow {
                limit,
                window_seconds,
                now,
                burst,
                ..
            } => vec![
                limit.to_string(),
                window_seconds.to_string(),
                now.to_string(),
                burst.to_string(),
            ],
            ScriptCall::TokenBucket {
                capacity,
                refill_rate,
                now,
                requested,
                ..
            } => vec![
                capacity.to_string(),
                refill_rate.to_string(),
                now.to_string(),
                requested.to_string(),
            ],
        }
    }
}

/// What a quota script returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptReply {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_at: i64,
}

impl ScriptReply {
    /// Decode the `{allowed, remaining, reset_at}` integer triple.
    pub fn from_triple(values: &[i64]) -> Option<Self> {
        match values {
            [allowed, remaining, reset_at] => Some(Self {
                allowed: *allowed == 1,
                remaining: (*remaining).max(0) as u64,
                reset_at: *reset_at,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_stable_and_distinct() {
        let fixed = QuotaScript::FixedWindow.handle();
        assert_eq!(fixed, QuotaScript::FixedWindow.handle());
        assert_ne!(fixed, QuotaScript::TokenBucket.handle());
        assert_eq!(fixed.as_str().len(), 40);
    }

    #[test]
    fn test_call_args_order() {
        let call = ScriptCall::FixedWindow {
            key: "ratelimit:t:/x:60".to_string(),
            limit: 5,
            window_seconds: 60,
            now: 75,
            burst: 2,
        };
        assert_eq!(call.script(), QuotaScript::FixedWindow);
        assert_eq!(call.key(), "ratelimit:t:/x:60");
        assert_eq!(call.args(), vec!["5", "60", "75", "2"]);

        let call = ScriptCall::TokenBucket {
            key: "tokenbucket:t:/x".to_string(),
            capacity: 10,
            refill_rate: 0.5,
            now: 75,
            requested: 1,
        };
        assert_eq!(call.args(), vec!["10", "0.5", "75", "1"]);
    }

    #[test]
    fn test_reply_decoding() {
        let reply = ScriptReply::from_triple(&[1, 3, 120]).unwrap();
        assert!(reply.allowed);
        assert_eq!(reply.remaining, 3);
        assert_eq!(reply.reset_at, 120);

        assert!(ScriptReply::from_triple(&[1, 3]).is_none());
    }

    #[test]
    fn test_token_bucket_script_ttl_matches_constant() {
        let expire = format!("redis.call('EXPIRE', key, {})", TOKEN_BUCKET_TTL_SECONDS);
        assert_eq!(TOKEN_BUCKET_SCRIPT.matches(&expire).count(), 2);
        assert_eq!(TOKEN_BUCKET_SCRIPT.matches("'EXPIRE'").count(), 2);
    }
}
