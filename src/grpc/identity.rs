//! Client identifier extraction.
//!
//! Each [`IdentifierStrategy`] variant has its own extraction function. The
//! combined strategy falls back to the address alone when the caller carries
//! no user identity.

use std::net::SocketAddr;

use tonic::metadata::MetadataMap;
use tracing::debug;

use crate::error::ExtractError;
use crate::ratelimit::IdentifierStrategy;

/// Proxy header listing the original client address first.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
/// Proxy header carrying a single client address.
pub const REAL_IP_HEADER: &str = "x-real-ip";
/// Metadata key carrying the authenticated user id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Read access to call metadata, for both tonic requests and raw HTTP/2 headers.
pub trait MetadataSource {
    /// First value for `key`, if present and valid ASCII.
    fn get_str(&self, key: &str) -> Option<&str>;
}

impl MetadataSource for MetadataMap {
    fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|value| value.to_str().ok())
    }
}

impl MetadataSource for http::HeaderMap {
    fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|value| value.to_str().ok())
    }
}

/// Derive the client identifier for `strategy`.
pub fn extract_identifier<M: MetadataSource + ?Sized>(
    strategy: IdentifierStrategy,
    metadata: &M,
    remote_addr: Option<SocketAddr>,
) -> Result<String, ExtractError> {
    match strategy {
        IdentifierStrategy::ByIp => client_ip(metadata, remote_addr),
        IdentifierStrategy::ByUserId => user_id(metadata),
        IdentifierStrategy::ByIpAndUserId => ip_and_user_id(metadata, remote_addr),
    }
}

/// Forwarded-for (left-most entry), then real-ip, then the transport peer.
pub fn client_ip<M: MetadataSource + ?Sized>(
    metadata: &M,
    remote_addr: Option<SocketAddr>,
) -> Result<String, ExtractError> {
    let forwarded = metadata
        .get_str(FORWARDED_FOR_HEADER)
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = forwarded {
        return Ok(ip.to_string());
    }

    if let Some(ip) = metadata
        .get_str(REAL_IP_HEADER)
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return Ok(ip.to_string());
    }

    remote_addr
        .map(|addr| addr.ip().to_string())
        .ok_or(ExtractError::MissingClientAddress)
}

/// The single user id carried in call metadata.
pub fn user_id<M: MetadataSource + ?Sized>(metadata: &M) -> Result<String, ExtractError> {
    metadata
        .get_str(USER_ID_HEADER)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or(ExtractError::MissingUserId)
}

/// `ip:user_id`, or just the ip when no user id is present.
pub fn ip_and_user_id<M: MetadataSource + ?Sized>(
    metadata: &M,
    remote_addr: Option<SocketAddr>,
) -> Result<String, ExtractError> {
    let ip = client_ip(metadata, remote_addr)?;
    match user_id(metadata) {
        Ok(user) => Ok(format!("{}:{}", ip, user)),
        Err(e) => {
            debug!(ip = %ip, reason = %e, "No user identity, limiting by address only");
            Ok(ip)
        }
    }
}
