//! gRPC integration: caller identification, admission control and the tower layer.

mod identity;
mod interceptor;
mod layer;
mod metrics;
mod server;

pub use identity::{
    client_ip, extract_identifier, ip_and_user_id, user_id, MetadataSource, FORWARDED_FOR_HEADER,
    REAL_IP_HEADER, USER_ID_HEADER,
};
pub use interceptor::{rate_limit_exceeded, Admission, BypassReason, RateLimitInterceptor};
pub use layer::{RateLimitLayer, RateLimitService};
pub use metrics::{MetricsRecorder, TracingRecorder};
pub use server::{
    connect_limiter, layer_with_limiter, memory_layer, memory_limiter, rate_limit_layer,
};
