//! Tower layer applying the rate limit interceptor to a tonic server.
//!
//! ```ignore
//! Server::builder()
//!     .layer(RateLimitLayer::new(interceptor))
//!     .add_service(my_service)
//!     .serve(addr)
//!     .await?;
//! ```

use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::header::{HeaderValue, CONTENT_TYPE};
use tonic::transport::server::TcpConnectInfo;
use tonic::Status;
use tower_layer::Layer;
use tower_service::Service;
use tracing::error;

use super::interceptor::{Admission, RateLimitInterceptor};
use crate::ratelimit::Limiter;

/// A layer that runs admission control before every gRPC call.
pub struct RateLimitLayer<L> {
    interceptor: Option<RateLimitInterceptor<L>>,
}

impl<L> Clone for RateLimitLayer<L> {
    fn clone(&self) -> Self {
        Self {
            interceptor: self.interceptor.clone(),
        }
    }
}

impl<L> RateLimitLayer<L> {
    /// Enforce limits with `interceptor`.
    pub fn new(interceptor: RateLimitInterceptor<L>) -> Self {
        Self {
            interceptor: Some(interceptor),
        }
    }

    /// A pass-through layer, used when rate limiting is switched off.
    pub fn disabled() -> Self {
        Self { interceptor: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.interceptor.is_some()
    }
}

impl<S, L> Layer<S> for RateLimitLayer<L> {
    type Service = RateLimitService<S, L>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService {
            inner: service,
            interceptor: self.interceptor.clone(),
        }
    }
}

/// Middleware service produced by [`RateLimitLayer`].
pub struct RateLimitService<S, L> {
    inner: S,
    interceptor: Option<RateLimitInterceptor<L>>,
}

impl<S: Clone, L> Clone for RateLimitService<S, L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            interceptor: self.interceptor.clone(),
        }
    }
}

impl<S, L, ReqBody, ResBody> Service<http::Request<ReqBody>> for RateLimitService<S, L>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    L: Limiter + 'static,
    ReqBody: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: http::Request<ReqBody>) -> Self::Future {
        // The clone may not be ready; keep the one that was polled.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let interceptor = self.interceptor.clone();

        Box::pin(async move {
            if let Some(interceptor) = interceptor {
                let method = request.uri().path().to_string();
                let remote_addr = request
                    .extensions()
                    .get::<TcpConnectInfo>()
                    .and_then(|info| info.remote_addr());

                let headers = request.headers();
                let admission = interceptor.admit(&method, headers, remote_addr).await;
                if let Admission::Rejected(status) = admission {
                    return Ok(status_response(&status));
                }
            }
            inner.call(request).await
        })
    }
}

/// Encode `status` as a trailers-only gRPC response.
fn status_response<B: Default>(status: &Status) -> http::Response<B> {
    let mut response = http::Response::new(B::default());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    if let Err(e) = status.add_header(headers) {
        error!(error = %e, "Failed to encode rate limit status");
    }
    response
}
