//! Rate limit key generation.

use std::fmt;

/// A key that uniquely identifies one client's counter for one endpoint.
///
/// The method's leading `/` is stripped and the remaining `/` separators are
/// normalized to `:`, so `/pkg.Svc/Method` called by `user-42` becomes
/// `pkg.Svc:Method:user-42`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    /// Build the key for a method and client identifier.
    pub fn new(method: &str, identifier: &str) -> Self {
        let method = method.strip_prefix('/').unwrap_or(method).replace('/', ":");
        Self(format!("{}:{}", method, identifier))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for RateLimitKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
