//! Rate limiting middleware.
//!
//! Final stage of the pipeline: a token bucket keyed by the trusted client
//! IP. `X-Forwarded-For` is honored only when the peer is in the configured
//! trusted-proxy set; otherwise the socket address wins.

use axum::{
    extract::ConnectInfo,
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use coffer_auth::{IpThrottle, ThrottleConfig};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{Layer, Service};
use tracing::warn;

use crate::api::ErrorBody;

// ============================================================================
// Config
// ============================================================================

/// Rate limit configuration (deserializable from TOML)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Enable rate limiting
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Bucket capacity (burst size) per client IP
    #[serde(default = "default_burst")]
    pub burst: u32,
    /// Sustained requests per second per client IP
    #[serde(default = "default_per_second")]
    pub per_second: f64,
}

fn default_true() -> bool {
    true
}
fn default_burst() -> u32 {
    60
}
fn default_per_second() -> f64 {
    1.0
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            burst: default_burst(),
            per_second: default_per_second(),
        }
    }
}

// ============================================================================
// Axum Layer
// ============================================================================

/// Rate limiting layer.
#[derive(Clone)]
pub struct RateLimitLayer {
    throttle: Arc<IpThrottle>,
    trusted_proxies: Arc<Vec<IpAddr>>,
    enabled: bool,
}

impl RateLimitLayer {
    /// Create the layer and spawn its periodic bucket sweep.
    pub fn new(settings: &RateLimitSettings, trusted_proxies: Vec<IpAddr>) -> Self {
        let throttle = Arc::new(IpThrottle::new(ThrottleConfig {
            capacity: settings.burst,
            refill_per_sec: settings.per_second,
        }));

        let sweeper = throttle.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                interval.tick().await;
                let _ = sweeper.cleanup().await;
            }
        });

        Self {
            throttle,
            trusted_proxies: Arc::new(trusted_proxies),
            enabled: settings.enabled,
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            throttle: self.throttle.clone(),
            trusted_proxies: self.trusted_proxies.clone(),
            enabled: self.enabled,
        }
    }
}

/// Rate limiting service wrapper.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    throttle: Arc<IpThrottle>,
    trusted_proxies: Arc<Vec<IpAddr>>,
    enabled: bool,
}

type BoxFuture<T, E> =
    std::pin::Pin<Box<dyn std::future::Future<Output = std::result::Result<T, E>> + Send>>;

impl<S, B> Service<Request<B>> for RateLimitService<S>
where
    S: Service<Request<B>, Response = Response> + Send + Clone + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<Response, S::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> BoxFuture<Response, S::Error> {
        let throttle = self.throttle.clone();
        let trusted_proxies = self.trusted_proxies.clone();
        let enabled = self.enabled;
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if !enabled {
                return inner.call(req).await;
            }

            let Some(ip) = client_ip(&req, &trusted_proxies) else {
                // No peer address (test harness); nothing to key on
                return inner.call(req).await;
            };

            let decision = throttle.acquire(ip).await;
            if decision.allowed {
                return inner.call(req).await;
            }

            warn!(client_ip = %ip, retry_after_secs = decision.retry_after_secs, "request rate limited");
            let response = (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", decision.retry_after_secs.to_string())],
                Json(ErrorBody {
                    error: "RATE_LIMITED",
                }),
            )
                .into_response();
            Ok(response)
        })
    }
}

/// Resolve the client IP, believing `X-Forwarded-For` only from trusted
/// proxies.
fn client_ip<B>(req: &Request<B>, trusted_proxies: &[IpAddr]) -> Option<IpAddr> {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())?;

    if trusted_proxies.contains(&peer) {
        if let Some(forwarded) = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
        {
            if let Some(ip) = forwarded
                .split(',')
                .next()
                .and_then(|entry| entry.trim().parse::<IpAddr>().ok())
            {
                return Some(ip);
            }
        }
    }

    Some(peer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_from(peer: IpAddr, forwarded: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/files");
        if let Some(value) = forwarded {
            builder = builder.header("x-forwarded-for", value);
        }
        let mut req = builder.body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::new(peer, 40000)));
        req
    }

    #[test]
    fn test_client_ip_ignores_forwarded_from_untrusted_peer() {
        let peer: IpAddr = "203.0.113.9".parse().unwrap();
        let req = request_from(peer, Some("198.51.100.1"));
        assert_eq!(client_ip(&req, &[]), Some(peer));
    }

    #[test]
    fn test_client_ip_honors_forwarded_from_trusted_proxy() {
        let proxy: IpAddr = "10.0.0.1".parse().unwrap();
        let client: IpAddr = "198.51.100.1".parse().unwrap();
        let req = request_from(proxy, Some("198.51.100.1, 10.0.0.1"));
        assert_eq!(client_ip(&req, &[proxy]), Some(client));
    }

    #[test]
    fn test_client_ip_falls_back_on_garbage_header() {
        let proxy: IpAddr = "10.0.0.1".parse().unwrap();
        let req = request_from(proxy, Some("not-an-ip"));
        assert_eq!(client_ip(&req, &[proxy]), Some(proxy));
    }
}
