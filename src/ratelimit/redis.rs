//! Fixed-window limiter backed by Redis.
//!
//! The check-and-decrement runs as a single Lua script so that every replica
//! sharing the Redis instance sees one serialized view of each counter.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Script};
use tracing::{error, instrument, trace};

use super::backend::{Limiter, Verdict};
use super::policy::MAX_WINDOW;
use crate::error::LimiterError;

/// Namespace prepended to every counter key.
pub const DEFAULT_KEY_PREFIX: &str = "rate_limit:";

/// Default bound on a single round trip to Redis.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(250);

/// Reconnect attempts made by [`RedisLimiter::connect`] after the first one.
pub const CONNECT_RETRIES: usize = 1;

/// Returns `{allowed, remaining, ttl_secs}`.
///
/// KEYS[1] = prefixed key, ARGV[1] = limit, ARGV[2] = window in seconds.
const ALLOW_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false then
    local remaining = tonumber(ARGV[1]) - 1
    redis.call('SET', KEYS[1], remaining, 'EX', ARGV[2])
    return {1, remaining, tonumber(ARGV[2])}
end
current = tonumber(current)
if current > 0 then
    local remaining = redis.call('DECR', KEYS[1])
    return {1, remaining, redis.call('TTL', KEYS[1])}
end
return {0, 0, redis.call('TTL', KEYS[1])}
"#;

/// A [`Limiter`] whose counters live in Redis.
#[derive(Clone)]
pub struct RedisLimiter {
    connection: ConnectionManager,
    script: Script,
    key_prefix: String,
    operation_timeout: Duration,
}

impl RedisLimiter {
    /// Create a builder around an established connection manager.
    pub fn builder(connection: ConnectionManager) -> Builder {
        Builder {
            connection,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Connect to `url`, giving up after a bounded number of attempts.
    ///
    /// Each attempt and every later round trip is limited to `timeout`. The
    /// returned builder already carries that timeout.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Builder, LimiterError> {
        let client = redis::Client::open(url)?;
        let config = ConnectionManagerConfig::new()
            .set_number_of_retries(CONNECT_RETRIES)
            .set_connection_timeout(timeout)
            .set_response_timeout(timeout);

        // Attempts plus backoff between them
        let budget = timeout * (CONNECT_RETRIES as u32 + 1) + Duration::from_secs(1);
        let connection =
            match tokio::time::timeout(budget, ConnectionManager::new_with_config(client, config))
                .await
            {
                Ok(result) => result?,
                Err(_) => return Err(LimiterError::Timeout(budget)),
            };
        Ok(Self::builder(connection).operation_timeout(timeout))
    }

    fn make_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn bounded<T, F>(&self, operation: F) -> Result<T, LimiterError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.operation_timeout, operation).await {
            Ok(result) => result.map_err(LimiterError::from),
            Err(_) => Err(LimiterError::Timeout(self.operation_timeout)),
        }
    }

    /// Consume one permit and report the full outcome.
    #[instrument(skip(self))]
    pub async fn check(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<Verdict, LimiterError> {
        let redis_key = self.make_key(key);
        let mut con = self.connection.clone();

        let reply: Vec<i64> = self
            .bounded(
                self.script
                    .key(&redis_key)
                    .arg(limit)
                    .arg(window_secs(window))
                    .invoke_async(&mut con),
            )
            .await?;

        let verdict = parse_reply(&reply)?;
        trace!(
            key = %redis_key,
            allowed = verdict.allowed,
            remaining = verdict.remaining,
            "Counter script evaluated"
        );
        Ok(verdict)
    }
}

/// Windows are stored as whole seconds; sub-second windows round up to one
/// and anything past [`MAX_WINDOW`] is capped.
pub(crate) fn window_secs(window: Duration) -> u64 {
    window.min(MAX_WINDOW).as_secs().max(1)
}

fn parse_reply(reply: &[i64]) -> Result<Verdict, LimiterError> {
    let [allowed, remaining, ttl] = reply else {
        return Err(LimiterError::MalformedReply(format!(
            "expected 3 integers, got {:?}",
            reply
        )));
    };
    if *remaining < 0 {
        return Err(LimiterError::MalformedReply(format!(
            "negative remaining count {}",
            remaining
        )));
    }

    // TTL is -1/-2 when the key has no expiry or vanished mid-script.
    let retry_after = u64::try_from(*ttl).ok().map(Duration::from_secs);
    Ok(match *allowed {
        1 => Verdict::granted(*remaining as u64, retry_after),
        0 => Verdict::denied(retry_after),
        other => {
            return Err(LimiterError::MalformedReply(format!(
                "unexpected allowed flag {}",
                other
            )))
        }
    })
}

/// Builder for [`RedisLimiter`], created by [`RedisLimiter::builder`] or
/// [`RedisLimiter::connect`].
pub struct Builder {
    connection: ConnectionManager,
    key_prefix: String,
    operation_timeout: Duration,
}

impl Builder {
    /// Override the namespace prefix (defaults to `rate_limit:`).
    pub fn key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    /// Bound every Redis round trip by `timeout`.
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Finish the limiter, loading the counter script.
    pub fn build(self) -> RedisLimiter {
        RedisLimiter {
            connection: self.connection,
            script: Script::new(ALLOW_SCRIPT),
            key_prefix: self.key_prefix,
            operation_timeout: self.operation_timeout,
        }
    }
}

#[async_trait]
impl Limiter for RedisLimiter {
    async fn allow(&self, key: &str, limit: u64, window: Duration) -> Result<bool, LimiterError> {
        match self.check(key, limit, window).await {
            Ok(verdict) => Ok(verdict.allowed),
            Err(e) => {
                error!(key = %key, error = %e, "Rate limit check failed, failing open");
                Err(e)
            }
        }
    }

    async fn remaining(&self, key: &str) -> Result<i64, LimiterError> {
        let redis_key = self.make_key(key);
        let mut con = self.connection.clone();
        let value: Option<i64> = self.bounded(con.get(&redis_key)).await?;
        Ok(value.unwrap_or(-1))
    }

    async fn reset(&self, key: &str) -> Result<(), LimiterError> {
        let redis_key = self.make_key(key);
        let mut con = self.connection.clone();
        let () = self.bounded(con.del(&redis_key)).await?;
        Ok(())
    }
}
