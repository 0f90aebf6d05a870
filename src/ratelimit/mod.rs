//! Rate limit policies and counter stores.

mod backend;
mod key;
mod memory;
mod policy;
mod redis;
mod rules;

pub use backend::{Limiter, Verdict};
pub use key::RateLimitKey;
pub use memory::{MemoryLimiter, DEFAULT_GC_INTERVAL};
pub use policy::{
    format_window, EndpointPolicy, IdentifierStrategy, PolicyTable, DEFAULT_POLICY, MAX_WINDOW,
};
pub use self::redis::{
    Builder as RedisLimiterBuilder, RedisLimiter, CONNECT_RETRIES, DEFAULT_KEY_PREFIX,
    DEFAULT_OPERATION_TIMEOUT,
};
pub use rules::{PolicyFile, PolicyRule};
