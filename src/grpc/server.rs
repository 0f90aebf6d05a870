//! Assembly of the rate limit layer from configuration.

use std::sync::Arc;

use tracing::{error, info, warn};

use super::interceptor::RateLimitInterceptor;
use super::layer::RateLimitLayer;
use super::metrics::MetricsRecorder;
use crate::config::{GatekeeperConfig, MemoryConfig, RateLimitingConfig, RedisConfig};
use crate::error::Result;
use crate::ratelimit::{Limiter, MemoryLimiter, PolicyTable, RedisLimiter};

/// Connect to Redis and build a limiter from `config`.
///
/// Connection attempts are bounded by the operation timeout.
pub async fn connect_limiter(config: &RedisConfig) -> Result<RedisLimiter> {
    let limiter = RedisLimiter::connect(&config.url, config.operation_timeout())
        .await?
        .key_prefix(config.key_prefix.as_str())
        .build();

    info!(
        url = %config.url,
        key_prefix = %config.key_prefix,
        timeout_ms = config.operation_timeout_ms,
        "Connected to Redis"
    );
    Ok(limiter)
}

/// Build an in-process limiter, sweeping expired records on the configured interval.
///
/// Must be called from within a Tokio runtime when the sweep is enabled.
pub fn memory_limiter(config: &MemoryConfig) -> MemoryLimiter {
    match config.gc_interval() {
        Some(interval) => MemoryLimiter::with_gc_interval(interval),
        None => MemoryLimiter::new(),
    }
}

/// Build the layer around an existing limiter.
///
/// Returns a pass-through layer when rate limiting is switched off.
pub fn layer_with_limiter<L: Limiter + 'static>(
    config: &RateLimitingConfig,
    limiter: Arc<L>,
    metrics: Option<Arc<dyn MetricsRecorder>>,
) -> Result<RateLimitLayer<L>> {
    if !config.enabled {
        warn!("Rate limiting is disabled by configuration");
        return Ok(RateLimitLayer::disabled());
    }
    let policies = config.load_policies()?;
    Ok(enforcing_layer(policies, limiter, metrics))
}

fn enforcing_layer<L: Limiter + 'static>(
    policies: PolicyTable,
    limiter: Arc<L>,
    metrics: Option<Arc<dyn MetricsRecorder>>,
) -> RateLimitLayer<L> {
    let policies = Arc::new(policies);
    info!(
        endpoints = policies.len(),
        default = %policies.default_policy().describe(),
        "Rate limit policies loaded"
    );

    let interceptor = match metrics {
        Some(metrics) => RateLimitInterceptor::with_metrics(limiter, policies, metrics),
        None => RateLimitInterceptor::new(limiter, policies),
    };
    RateLimitLayer::new(interceptor)
}

/// Build the Redis-backed layer described by `config`.
///
/// Redis is not contacted when rate limiting is switched off. If Redis cannot
/// be reached the layer lets every call through; only an invalid policy file
/// is an error.
pub async fn rate_limit_layer(
    config: &GatekeeperConfig,
    metrics: Option<Arc<dyn MetricsRecorder>>,
) -> Result<RateLimitLayer<RedisLimiter>> {
    if !config.rate_limiting.enabled {
        warn!("Rate limiting is disabled by configuration");
        return Ok(RateLimitLayer::disabled());
    }

    let policies = config.rate_limiting.load_policies()?;
    match connect_limiter(&config.redis).await {
        Ok(limiter) => Ok(enforcing_layer(policies, Arc::new(limiter), metrics)),
        Err(e) => {
            error!(
                url = %config.redis.url,
                error = %e,
                "Redis unavailable at startup, rate limiting fails open"
            );
            Ok(RateLimitLayer::disabled())
        }
    }
}

/// Build the in-process layer described by `config`.
pub fn memory_layer(
    config: &GatekeeperConfig,
    metrics: Option<Arc<dyn MetricsRecorder>>,
) -> Result<RateLimitLayer<MemoryLimiter>> {
    if !config.rate_limiting.enabled {
        warn!("Rate limiting is disabled by configuration");
        return Ok(RateLimitLayer::disabled());
    }
    let limiter = Arc::new(memory_limiter(&config.memory));
    layer_with_limiter(&config.rate_limiting, limiter, metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::time::{Duration, Instant};
    use tower::{service_fn, ServiceExt};
    use tower_layer::Layer;

    fn request() -> http::Request<()> {
        http::Request::builder()
            .uri("http://localhost/listings.v1.OrderService/CreateOrder")
            .header("x-real-ip", "198.51.100.4")
            .header("x-user-id", "user-42")
            .body(())
            .unwrap()
    }

    #[tokio::test]
    async fn test_disabled_config_skips_redis() {
        let mut config = GatekeeperConfig::default();
        config.rate_limiting.enabled = false;
        config.redis.url = "redis://unreachable.invalid:6379".to_string();

        let layer = rate_limit_layer(&config, None).await.unwrap();
        assert!(!layer.is_enabled());
    }

    #[tokio::test]
    async fn test_unreachable_redis_fails_open_quickly() {
        let mut config = GatekeeperConfig::default();
        config.redis.url = "redis://127.0.0.1:1".to_string();
        config.redis.operation_timeout_ms = 100;

        let started = Instant::now();
        let layer = rate_limit_layer(&config, None).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));

        let inner = service_fn(|_req: http::Request<()>| async {
            Ok::<_, Infallible>(http::Response::new(String::from("ok")))
        });
        let service = layer.layer(inner);
        // Well past the 5 per minute order policy
        for _ in 0..10 {
            let response = service.clone().oneshot(request()).await.unwrap();
            assert_eq!(response.into_body(), "ok");
        }
    }

    #[tokio::test]
    async fn test_unreachable_redis_is_an_error_for_direct_connect() {
        let config = RedisConfig {
            url: "redis://127.0.0.1:1".to_string(),
            operation_timeout_ms: 100,
            ..RedisConfig::default()
        };
        let started = Instant::now();
        assert!(connect_limiter(&config).await.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_bad_policy_file_still_reported_before_connecting() {
        let mut config = GatekeeperConfig::default();
        config.redis.url = "redis://127.0.0.1:1".to_string();
        config.rate_limiting.policy_path = Some("/nonexistent/policies.yaml".to_string());
        assert!(rate_limit_layer(&config, None).await.is_err());
    }

    #[test]
    fn test_enabled_layer_with_builtin_policies() {
        let config = RateLimitingConfig::default();
        let layer = layer_with_limiter(&config, Arc::new(MemoryLimiter::new()), None).unwrap();
        assert!(layer.is_enabled());
    }

    #[test]
    fn test_bad_policy_path_is_reported() {
        let config = RateLimitingConfig {
            enabled: true,
            policy_path: Some("/nonexistent/policies.yaml".to_string()),
        };
        assert!(layer_with_limiter(&config, Arc::new(MemoryLimiter::new()), None).is_err());
    }

    #[tokio::test]
    async fn test_memory_layer_enforces_order_policy() {
        let config = GatekeeperConfig::default();
        let service = memory_layer(&config, None).unwrap().layer(service_fn(
            |_req: http::Request<()>| async {
                Ok::<_, Infallible>(http::Response::new(String::new()))
            },
        ));

        for _ in 0..5 {
            let response = service.clone().oneshot(request()).await.unwrap();
            assert!(response.headers().get("grpc-status").is_none());
        }
        let response = service.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.headers()["grpc-status"], "8");
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_connect_limiter() {
        let mut config = RedisConfig::default();
        if let Ok(url) = std::env::var("REDIS_URL") {
            config.url = url;
        }
        let limiter = connect_limiter(&config).await.unwrap();
        limiter.reset("server:test").await.unwrap();
        assert!(limiter.allow("server:test", 1, Duration::from_secs(5)).await.unwrap());
    }
}
