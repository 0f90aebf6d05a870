//! In-process fixed-window limiter.
//!
//! Useful for a single replica and for tests. Each key's check-and-decrement
//! runs under the dashmap shard lock for that key, so concurrent callers in
//! this process never over-grant.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::backend::{Limiter, Verdict};
use super::policy::MAX_WINDOW;
use crate::error::LimiterError;

/// Default period of the background cleanup task.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(60);

struct Slot {
    remaining: u64,
    expires_at: Instant,
}

type Slots = DashMap<String, Slot>;

/// Aborts the cleanup task once the last limiter clone is gone.
struct GcTask(JoinHandle<()>);

impl Drop for GcTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A [`Limiter`] that keeps its counters in memory.
#[derive(Clone, Default)]
pub struct MemoryLimiter {
    slots: Arc<Slots>,
    _gc: Option<Arc<GcTask>>,
}

impl MemoryLimiter {
    /// Create a limiter without background cleanup.
    ///
    /// Expired records are replaced on the next check for the same key but
    /// otherwise stay until [`purge_expired`](Self::purge_expired) runs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a limiter that drops expired records every `interval`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_gc_interval(interval: Duration) -> Self {
        let slots = Arc::new(Slots::new());
        let task = garbage_collector(slots.clone(), interval.max(Duration::from_millis(1)));
        Self {
            slots,
            _gc: Some(Arc::new(GcTask(task))),
        }
    }

    /// Consume one permit and report the full outcome.
    ///
    /// Windows longer than [`MAX_WINDOW`] are shortened to it.
    pub fn check(&self, key: &str, limit: u64, window: Duration) -> Verdict {
        let window = window.min(MAX_WINDOW);
        let now = Instant::now();
        let fresh = || Slot {
            remaining: limit.saturating_sub(1),
            expires_at: now + window,
        };

        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut entry) if entry.get().expires_at > now => {
                let slot = entry.get_mut();
                let retry_after = Some(slot.expires_at - now);
                if slot.remaining > 0 {
                    slot.remaining -= 1;
                    Verdict::granted(slot.remaining, retry_after)
                } else {
                    Verdict::denied(retry_after)
                }
            }
            Entry::Occupied(mut entry) => {
                trace!(key = %key, "Window expired, starting a new one");
                *entry.get_mut() = fresh();
                Verdict::granted(limit.saturating_sub(1), Some(window))
            }
            Entry::Vacant(entry) => {
                entry.insert(fresh());
                Verdict::granted(limit.saturating_sub(1), Some(window))
            }
        }
    }

    /// Remove every record whose window has elapsed.
    pub fn purge_expired(&self) {
        purge(&self.slots, Instant::now());
    }

    /// Number of records currently held, live or expired.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

fn purge(slots: &Slots, now: Instant) {
    let before = slots.len();
    slots.retain(|_, slot| slot.expires_at > now);
    debug!(
        removed = before.saturating_sub(slots.len()),
        "Purged expired rate limit records"
    );
}

fn garbage_collector(slots: Arc<Slots>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = Instant::now();
            purge(&slots, now);
            tokio::time::sleep_until(now + interval).await;
        }
    })
}

#[async_trait]
impl Limiter for MemoryLimiter {
    async fn allow(&self, key: &str, limit: u64, window: Duration) -> Result<bool, LimiterError> {
        Ok(self.check(key, limit, window).allowed)
    }

    async fn remaining(&self, key: &str) -> Result<i64, LimiterError> {
        let now = Instant::now();
        Ok(match self.slots.get(key) {
            Some(slot) if slot.expires_at > now => slot.remaining as i64,
            _ => -1,
        })
    }

    async fn reset(&self, key: &str) -> Result<(), LimiterError> {
        self.slots.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_allows_exactly_limit_requests() {
        let limiter = MemoryLimiter::new();
        for i in 1..=5 {
            assert!(limiter.allow("k", 5, WINDOW).await.unwrap(), "request {} should pass", i);
        }
        assert!(!limiter.allow("k", 5, WINDOW).await.unwrap());
    }

    #[tokio::test]
    async fn test_remaining_counts_down() {
        let limiter = MemoryLimiter::new();
        assert_eq!(limiter.remaining("k").await.unwrap(), -1);

        for _ in 0..3 {
            limiter.allow("k", 5, WINDOW).await.unwrap();
        }
        assert_eq!(limiter.remaining("k").await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expiry_starts_fresh() {
        let limiter = MemoryLimiter::new();
        assert!(limiter.allow("k", 1, WINDOW).await.unwrap());
        assert!(!limiter.allow("k", 1, WINDOW).await.unwrap());

        tokio::time::advance(WINDOW).await;

        assert_eq!(limiter.remaining("k").await.unwrap(), -1);
        let verdict = limiter.check("k", 3, WINDOW);
        assert!(verdict.allowed);
        assert_eq!(verdict.remaining, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_verdict_reports_retry_after() {
        let limiter = MemoryLimiter::new();
        limiter.check("k", 1, WINDOW);
        tokio::time::advance(Duration::from_secs(4)).await;

        let verdict = limiter.check("k", 1, WINDOW);
        assert!(!verdict.allowed);
        assert_eq!(verdict.remaining, 0);
        assert_eq!(verdict.retry_after, Some(Duration::from_secs(6)));
    }

    #[tokio::test]
    async fn test_reset_restores_fresh_state() {
        let limiter = MemoryLimiter::new();
        assert!(limiter.allow("k", 1, WINDOW).await.unwrap());
        assert!(!limiter.allow("k", 1, WINDOW).await.unwrap());

        limiter.reset("k").await.unwrap();
        assert_eq!(limiter.remaining("k").await.unwrap(), -1);
        assert!(limiter.allow("k", 1, WINDOW).await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = MemoryLimiter::new();
        assert!(limiter.allow("a", 1, WINDOW).await.unwrap());
        assert!(!limiter.allow("a", 1, WINDOW).await.unwrap());
        assert!(limiter.allow("b", 1, WINDOW).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allow_grants_exactly_limit() {
        let limiter = MemoryLimiter::new();
        let barrier = Arc::new(tokio::sync::Barrier::new(50));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = limiter.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                limiter.allow("shared", 10, WINDOW).await.unwrap()
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let limiter = MemoryLimiter::new();
        limiter.check("short", 1, Duration::from_secs(1));
        limiter.check("long", 1, Duration::from_secs(60));
        assert_eq!(limiter.len(), 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        limiter.purge_expired();
        assert_eq!(limiter.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_gc_drops_expired_records() {
        let limiter = MemoryLimiter::with_gc_interval(Duration::from_secs(5));
        limiter.check("short", 1, Duration::from_secs(1));
        limiter.check("long", 1, Duration::from_secs(60));
        assert_eq!(limiter.len(), 2);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(limiter.len(), 1);
        assert_eq!(limiter.remaining("long").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_task_stops_with_last_clone() {
        let limiter = MemoryLimiter::with_gc_interval(Duration::from_secs(1));
        let slots = limiter.slots.clone();
        let clone = limiter.clone();

        drop(limiter);
        tokio::time::sleep(Duration::from_secs(2)).await;
        // The task still holds its reference while a clone is alive
        assert_eq!(Arc::strong_count(&slots), 3);

        drop(clone);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(Arc::strong_count(&slots), 1);
    }

    #[tokio::test]
    async fn test_oversized_window_does_not_overflow() {
        let limiter = MemoryLimiter::new();
        let verdict = limiter.check("k", 2, Duration::from_secs(u64::MAX));
        assert!(verdict.allowed);
        assert_eq!(verdict.retry_after, Some(MAX_WINDOW));
        assert!(limiter.allow("k", 2, Duration::MAX).await.unwrap());
        assert!(!limiter.allow("k", 2, Duration::MAX).await.unwrap());
    }
}
