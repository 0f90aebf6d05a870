//! Limiter trait for abstracting the counter store.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::LimiterError;

/// Trait for fixed-window counter stores.
///
/// Implementations must be safe to call concurrently for the same key,
/// including from separate processes sharing one store, and must never grant
/// more than `limit` requests for a key within one window.
///
/// An `Err` means no decision could be made. Callers admit the request.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Consume one permit for `key`, creating the window on first use.
    async fn allow(&self, key: &str, limit: u64, window: Duration) -> Result<bool, LimiterError>;

    /// Permits left in the current window, or `-1` if the key has no live record.
    async fn remaining(&self, key: &str) -> Result<i64, LimiterError>;

    /// Drop the record for `key` so the next request starts a fresh window.
    async fn reset(&self, key: &str) -> Result<(), LimiterError>;
}

/// Full outcome of a single permit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    /// Whether a permit was granted
    pub allowed: bool,
    /// Permits left in the window after this check
    pub remaining: u64,
    /// Time until the window resets, when known
    pub retry_after: Option<Duration>,
}

impl Verdict {
    pub(crate) fn granted(remaining: u64, retry_after: Option<Duration>) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after,
        }
    }

    pub(crate) fn denied(retry_after: Option<Duration>) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            retry_after,
        }
    }
}
