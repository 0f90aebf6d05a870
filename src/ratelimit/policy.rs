//! Per-endpoint rate limit policies.
//!
//! Policies are looked up by the fully-qualified gRPC method name
//! (`/package.Service/Method`). Matching is exact; anything without an
//! explicit entry gets the table's default policy.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::PolicyError;

/// How the client identifier for a rate limit key is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierStrategy {
    /// Client network address.
    ByIp,
    /// Authenticated user id from call metadata.
    ByUserId,
    /// Address and user id combined, degrading to the address alone.
    ByIpAndUserId,
}

impl IdentifierStrategy {
    /// Stable name used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierStrategy::ByIp => "by_ip",
            IdentifierStrategy::ByUserId => "by_user_id",
            IdentifierStrategy::ByIpAndUserId => "by_ip_and_user_id",
        }
    }
}

impl Default for IdentifierStrategy {
    fn default() -> Self {
        IdentifierStrategy::ByIp
    }
}

impl fmt::Display for IdentifierStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rate limit applied to a single endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointPolicy {
    /// Maximum requests allowed per window
    pub limit: u64,
    /// Length of the fixed window
    pub window: Duration,
    /// How callers are told apart
    pub strategy: IdentifierStrategy,
    /// Whether the policy is enforced at all
    pub enabled: bool,
}

impl EndpointPolicy {
    /// Create an enabled policy.
    pub const fn new(limit: u64, window: Duration, strategy: IdentifierStrategy) -> Self {
        Self {
            limit,
            window,
            strategy,
            enabled: true,
        }
    }

    /// Return a copy of this policy with `enabled` set.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Check the policy invariants (`limit > 0`, `0 < window <= MAX_WINDOW`).
    pub fn validate(&self, method: &str) -> Result<(), PolicyError> {
        if self.limit == 0 {
            return Err(PolicyError::ZeroLimit {
                method: method.to_string(),
            });
        }
        if self.window.is_zero() {
            return Err(PolicyError::ZeroWindow {
                method: method.to_string(),
            });
        }
        if self.window > MAX_WINDOW {
            return Err(PolicyError::WindowTooLong {
                method: method.to_string(),
                max_secs: MAX_WINDOW.as_secs(),
            });
        }
        Ok(())
    }

    /// Human readable description used in rejection messages.
    pub fn describe(&self) -> String {
        format!(
            "maximum {} requests per {}",
            self.limit,
            format_window(self.window)
        )
    }
}

#[derive(Debug)]
struct Policies {
    endpoints: HashMap<String, EndpointPolicy>,
    default: EndpointPolicy,
}

/// Method name to policy mapping with a default fallback.
///
/// Lookups take a read lock; enable/disable toggles and whole-table swaps
/// take the write lock briefly.
#[derive(Debug)]
pub struct PolicyTable {
    inner: RwLock<Policies>,
}

impl PolicyTable {
    /// Create an empty table that resolves every method to `default`.
    pub fn new(default: EndpointPolicy) -> Self {
        Self {
            inner: RwLock::new(Policies {
                endpoints: HashMap::new(),
                default,
            }),
        }
    }

    /// Builder-style registration of an explicit endpoint policy.
    pub fn with_endpoint(self, method: impl Into<String>, policy: EndpointPolicy) -> Self {
        self.insert(method, policy);
        self
    }

    /// Register or overwrite an explicit endpoint policy.
    pub fn insert(&self, method: impl Into<String>, policy: EndpointPolicy) {
        self.inner.write().endpoints.insert(method.into(), policy);
    }

    /// Resolve the policy for `method`. Never fails.
    pub fn policy(&self, method: &str) -> EndpointPolicy {
        let inner = self.inner.read();
        inner
            .endpoints
            .get(method)
            .copied()
            .unwrap_or(inner.default)
    }

    /// Whether the policy resolved for `method` is enforced.
    pub fn is_enabled(&self, method: &str) -> bool {
        self.policy(method).enabled
    }

    /// Turn enforcement on for an explicitly registered method.
    ///
    /// Returns `false` (and changes nothing) if the method has no entry.
    pub fn enable_endpoint(&self, method: &str) -> bool {
        self.set_enabled(method, true)
    }

    /// Turn enforcement off for an explicitly registered method.
    ///
    /// Returns `false` (and changes nothing) if the method has no entry.
    pub fn disable_endpoint(&self, method: &str) -> bool {
        self.set_enabled(method, false)
    }

    fn set_enabled(&self, method: &str, enabled: bool) -> bool {
        let mut inner = self.inner.write();
        match inner.endpoints.get_mut(method) {
            Some(policy) => {
                policy.enabled = enabled;
                info!(method = %method, enabled, "Endpoint rate limit toggled");
                true
            }
            None => {
                debug!(method = %method, "No explicit policy to toggle");
                false
            }
        }
    }

    /// Atomically swap in the contents of another table.
    pub fn replace(&self, other: PolicyTable) {
        let next = other.inner.into_inner();
        let count = next.endpoints.len();
        *self.inner.write() = next;
        info!(endpoints = count, "Rate limit policy table replaced");
    }

    /// The fallback policy.
    pub fn default_policy(&self) -> EndpointPolicy {
        self.inner.read().default
    }

    /// Snapshot of the explicit entries, sorted by method name.
    pub fn endpoints(&self) -> Vec<(String, EndpointPolicy)> {
        let inner = self.inner.read();
        let mut entries: Vec<_> = inner
            .endpoints
            .iter()
            .map(|(method, policy)| (method.clone(), *policy))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Number of explicit entries.
    pub fn len(&self) -> usize {
        self.inner.read().endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

const MINUTE: Duration = Duration::from_secs(60);

/// Longest window a policy may declare (one year).
pub const MAX_WINDOW: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Fallback applied to methods without an explicit entry.
pub const DEFAULT_POLICY: EndpointPolicy =
    EndpointPolicy::new(100, MINUTE, IdentifierStrategy::ByIp);

impl Default for PolicyTable {
    /// The built-in table for the listings service.
    fn default() -> Self {
        use IdentifierStrategy::*;

        PolicyTable::new(DEFAULT_POLICY)
            .with_endpoint(
                "/listings.v1.ListingsService/CreateListing",
                EndpointPolicy::new(10, MINUTE, ByUserId),
            )
            .with_endpoint(
                "/listings.v1.ListingsService/UpdateListing",
                EndpointPolicy::new(20, MINUTE, ByUserId),
            )
            .with_endpoint(
                "/listings.v1.ListingsService/DeleteListing",
                EndpointPolicy::new(10, MINUTE, ByUserId),
            )
            .with_endpoint(
                "/listings.v1.ListingsService/UploadListingImage",
                EndpointPolicy::new(30, MINUTE, ByUserId),
            )
            .with_endpoint(
                "/listings.v1.ListingsService/GetListing",
                EndpointPolicy::new(200, MINUTE, ByIp),
            )
            .with_endpoint(
                "/listings.v1.ListingsService/SearchListings",
                EndpointPolicy::new(60, MINUTE, ByIp),
            )
            .with_endpoint(
                "/listings.v1.OrderService/CreateOrder",
                EndpointPolicy::new(5, MINUTE, ByIpAndUserId),
            )
            .with_endpoint(
                "/listings.v1.ChatService/SendMessage",
                EndpointPolicy::new(30, MINUTE, ByUserId),
            )
    }
}

/// Format a window the way rejection messages print it: `500ms`, `10s`,
/// `1m30s`, `1h0m0s`.
pub fn format_window(window: Duration) -> String {
    if window.is_zero() {
        return "0s".to_string();
    }

    let secs = window.as_secs();
    if secs == 0 {
        let nanos = window.subsec_nanos();
        return if nanos % 1_000_000 == 0 {
            format!("{}ms", nanos / 1_000_000)
        } else if nanos % 1_000 == 0 {
            format!("{}µs", nanos / 1_000)
        } else {
            format!("{}ns", nanos)
        };
    }

    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if hours > 0 || minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }

    let nanos = window.subsec_nanos();
    if nanos == 0 {
        out.push_str(&format!("{}s", seconds));
    } else {
        let fraction = format!("{:09}", nanos);
        out.push_str(&format!("{}.{}s", seconds, fraction.trim_end_matches('0')));
    }
    out
}
