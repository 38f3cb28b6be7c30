//! Rate limiting logic and policy management.

mod clock;
pub mod fixed_window;
mod limiter;
mod mutator;
mod observer;
mod policies;
mod policy;
mod resolver;
pub mod token_bucket;

pub use clock::{Clock, ManualClock, SystemClock};
pub use fixed_window::FixedWindowEvaluator;
pub use limiter::{Evaluation, FailureMode, LimiterSettings, RateLimitHeaders, RateLimiter};
pub use mutator::AtomicStateMutator;
pub use observer::{DecisionEvent, DecisionObserver, FanoutObserver, TracingObserver};
pub use policies::{load_seed_file, parse_seed_yaml, PolicyRepository};
pub use policy::{
    Algorithm, Decision, DefaultPolicy, EvaluateRequest, FixedWindowParams, Policy, Quota, Scope,
    TokenBucketParams, MAX_BURST, MAX_LIMIT, MAX_ROUTE_LEN, MAX_TENANT_ID_LEN, MAX_TTL_SECONDS,
    MAX_WINDOW_SECONDS,
};
pub use resolver::PolicyResolver;
pub use token_bucket::TokenBucketEvaluator;
