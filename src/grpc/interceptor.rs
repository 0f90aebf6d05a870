//! Rate limit interceptor for gRPC calls.
//!
//! Every call goes through [`RateLimitInterceptor::admit`], which resolves the
//! endpoint policy, identifies the caller and asks the [`Limiter`] for a
//! permit. Only a definite "no permit" rejects the call; every failure inside
//! the rate limiter lets the call through.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{error, trace, warn};

use super::identity::{extract_identifier, MetadataSource};
use super::metrics::MetricsRecorder;
use crate::error::ExtractError;
use crate::ratelimit::{EndpointPolicy, Limiter, PolicyTable, RateLimitKey};

/// Why a call was let through without a rate limit decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    /// The endpoint's policy is switched off.
    PolicyDisabled,
    /// No identifier could be derived for the policy's strategy.
    IdentifierUnavailable(ExtractError),
    /// The counter store failed or timed out.
    LimiterUnavailable,
}

/// Outcome of admission control for a single call.
#[derive(Debug, Clone)]
pub enum Admission {
    /// Evaluated and granted a permit.
    Allowed,
    /// Not evaluated; the call fails open.
    Bypass(BypassReason),
    /// Evaluated and over the limit.
    Rejected(Status),
}

impl Admission {
    /// Whether the handler should run.
    pub fn proceeds(&self) -> bool {
        !matches!(self, Admission::Rejected(_))
    }
}

/// Status returned to callers over their limit.
pub fn rate_limit_exceeded(policy: &EndpointPolicy) -> Status {
    Status::resource_exhausted(format!("rate limit exceeded: {}", policy.describe()))
}

/// Admission control in front of gRPC handlers.
pub struct RateLimitInterceptor<L> {
    limiter: Arc<L>,
    policies: Arc<PolicyTable>,
    metrics: Option<Arc<dyn MetricsRecorder>>,
}

impl<L> Clone for RateLimitInterceptor<L> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            policies: self.policies.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<L: Limiter + 'static> RateLimitInterceptor<L> {
    /// Create an interceptor without metrics.
    pub fn new(limiter: Arc<L>, policies: Arc<PolicyTable>) -> Self {
        Self {
            limiter,
            policies,
            metrics: None,
        }
    }

    /// Create an interceptor that reports each evaluation to `metrics`.
    pub fn with_metrics(
        limiter: Arc<L>,
        policies: Arc<PolicyTable>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self {
            limiter,
            policies,
            metrics: Some(metrics),
        }
    }

    /// The policy table consulted for every call.
    pub fn policies(&self) -> &Arc<PolicyTable> {
        &self.policies
    }

    /// The counter store behind this interceptor.
    pub fn limiter(&self) -> &Arc<L> {
        &self.limiter
    }

    /// Decide whether a call to `method` may proceed.
    pub async fn admit<M: MetadataSource + ?Sized>(
        &self,
        method: &str,
        metadata: &M,
        remote_addr: Option<SocketAddr>,
    ) -> Admission {
        let policy = self.policies.policy(method);
        if !policy.enabled {
            trace!(method = %method, "Rate limiting disabled for endpoint");
            return Admission::Bypass(BypassReason::PolicyDisabled);
        }

        let identifier = match extract_identifier(policy.strategy, metadata, remote_addr) {
            Ok(identifier) => identifier,
            Err(e) => {
                error!(
                    method = %method,
                    strategy = %policy.strategy,
                    error = %e,
                    "Failed to identify caller, failing open"
                );
                return Admission::Bypass(BypassReason::IdentifierUnavailable(e));
            }
        };

        let key = RateLimitKey::new(method, &identifier);
        let allowed = match self
            .limiter
            .allow(key.as_str(), policy.limit, policy.window)
            .await
        {
            Ok(allowed) => allowed,
            Err(e) => {
                error!(
                    method = %method,
                    key = %key,
                    error = %e,
                    "Rate limiter unavailable, failing open"
                );
                return Admission::Bypass(BypassReason::LimiterUnavailable);
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_rate_limit_evaluation(method, policy.strategy.as_str(), allowed);
        }

        if allowed {
            trace!(method = %method, key = %key, "Rate limit permit granted");
            Admission::Allowed
        } else {
            warn!(
                method = %method,
                identifier = %identifier,
                limit = policy.limit,
                window = ?policy.window,
                "Rate limit exceeded"
            );
            Admission::Rejected(rate_limit_exceeded(&policy))
        }
    }

    /// Intercept a unary call.
    ///
    /// `handler` runs at most once, and not at all when the call is rejected.
    pub async fn unary<Req, Res, F, Fut>(
        &self,
        method: &str,
        request: Request<Req>,
        handler: F,
    ) -> Result<Response<Res>, Status>
    where
        F: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Res>, Status>>,
    {
        self.intercept(method, request, handler).await
    }

    /// Intercept a streaming call. `request` carries the inbound message
    /// stream (or a single message for server streaming), and `Res` is the
    /// outbound stream.
    pub async fn streaming<S, Res, F, Fut>(
        &self,
        method: &str,
        request: Request<S>,
        handler: F,
    ) -> Result<Response<Res>, Status>
    where
        F: FnOnce(Request<S>) -> Fut,
        Fut: Future<Output = Result<Response<Res>, Status>>,
    {
        self.intercept(method, request, handler).await
    }

    async fn intercept<T, Res, F, Fut>(
        &self,
        method: &str,
        request: Request<T>,
        handler: F,
    ) -> Result<Response<Res>, Status>
    where
        F: FnOnce(Request<T>) -> Fut,
        Fut: Future<Output = Result<Response<Res>, Status>>,
    {
        let remote_addr = request.remote_addr();
        let metadata = request.metadata();
        let admission = self.admit(method, metadata, remote_addr).await;
        match admission {
            Admission::Rejected(status) => Err(status),
            Admission::Allowed | Admission::Bypass(_) => handler(request).await,
        }
    }
}
