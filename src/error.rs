//! Error types for the Gatekeeper rate limiter.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid endpoint policy
    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    /// Counter store errors
    #[error("Limiter error: {0}")]
    Limiter(#[from] LimiterError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for GatekeeperError {
    fn from(err: config::ConfigError) -> Self {
        GatekeeperError::Config(err.to_string())
    }
}

/// Errors raised while validating an endpoint policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("limit for {method} must be greater than zero")]
    ZeroLimit { method: String },

    #[error("window for {method} must be greater than zero")]
    ZeroWindow { method: String },

    #[error("window for {method} exceeds the maximum of {max_secs}s")]
    WindowTooLong { method: String, max_secs: u64 },
}

/// Errors returned by a [`Limiter`](crate::ratelimit::Limiter).
///
/// A limiter error never means "deny". Callers admit the request (fail open).
#[derive(Error, Debug)]
pub enum LimiterError {
    /// The counter store could not be reached or rejected the command.
    #[error("counter store error: {0}")]
    Backend(#[from] redis::RedisError),

    /// The atomic script returned something other than `{allowed, remaining, ttl}`.
    #[error("malformed reply from counter store: {0}")]
    MalformedReply(String),

    /// The operation did not complete within the configured timeout.
    #[error("counter store operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors raised when a client identifier cannot be derived from a call.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractError {
    #[error("no forwarded address, real ip header or peer address on the call")]
    MissingClientAddress,

    #[error("no user identity in call metadata")]
    MissingUserId,
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
