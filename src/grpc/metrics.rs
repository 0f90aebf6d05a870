//! Metrics hook for rate limit evaluations.

use tracing::debug;

/// Receives one event per genuinely evaluated request.
///
/// Not called when the policy is disabled or when the request bypassed the
/// limiter because identification or the counter store failed.
pub trait MetricsRecorder: Send + Sync {
    fn record_rate_limit_evaluation(&self, method: &str, identifier_strategy: &str, allowed: bool);
}

/// Recorder that emits each evaluation as a `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingRecorder;

impl MetricsRecorder for TracingRecorder {
    fn record_rate_limit_evaluation(&self, method: &str, identifier_strategy: &str, allowed: bool) {
        debug!(
            target: "gatekeeper::metrics",
            method = %method,
            strategy = %identifier_strategy,
            allowed,
            "Rate limit evaluated"
        );
    }
}
