//! Authentication middleware.
//!
//! First stage of the pipeline: resolves the `Authorization` header into
//! verified claims, or marks the request as exempt per the closed exemption
//! table. Signature, expiry, and issuer are checked here; audience
//! enforcement happens in the scope stage.

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, Request, StatusCode},
    response::Response,
};
use coffer_auth::{Claims, TokenCodec};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::debug;

use crate::api::error_response;
use crate::middleware::scope::path_matches;

/// Routes that proceed without a credential. Closed table, first match wins.
pub const AUTH_EXEMPT: &[(&str, &str)] = &[
    ("POST", "/auth/login"),
    ("POST", "/auth/verify"),
    ("POST", "/auth/refresh"),
    ("POST", "/auth/reset-password"),
    ("POST", "/auth/reset-password/{uuid}/validate"),
    ("GET", "/auth/providers"),
    ("GET", "/auth/sso/{provider}/callback"),
    ("GET", "/health"),
];

/// Marker set in the request context for exempt routes; later stages skip
/// credential checks when present.
#[derive(Debug, Clone, Copy)]
pub struct AuthExempt;

/// Whether a request is on the exemption table.
pub fn is_exempt(method: &str, path: &str) -> bool {
    AUTH_EXEMPT
        .iter()
        .any(|(m, pattern)| *m == method && path_matches(pattern, path))
}

// ============================================================================
// Principal extractor
// ============================================================================

/// Handler-side extractor for the authenticated claims attached by the
/// pipeline.
pub struct Principal(pub Claims);

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Claims>()
            .cloned()
            .map(Principal)
            .ok_or_else(|| error_response(StatusCode::FORBIDDEN, "FORBIDDEN"))
    }
}

// ============================================================================
// Axum Layer
// ============================================================================

/// Authentication layer.
#[derive(Clone)]
pub struct AuthenticateLayer {
    codec: Arc<TokenCodec>,
}

impl AuthenticateLayer {
    /// Create the layer around the token codec.
    pub fn new(codec: Arc<TokenCodec>) -> Self {
        Self { codec }
    }
}

impl<S> Layer<S> for AuthenticateLayer {
    type Service = AuthenticateService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthenticateService {
            inner,
            codec: self.codec.clone(),
        }
    }
}

/// Authentication service wrapper.
#[derive(Clone)]
pub struct AuthenticateService<S> {
    inner: S,
    codec: Arc<TokenCodec>,
}

type BoxFuture<T, E> =
    std::pin::Pin<Box<dyn std::future::Future<Output = std::result::Result<T, E>> + Send>>;

impl<S, B> Service<Request<B>> for AuthenticateService<S>
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

    fn call(&mut self, mut req: Request<B>) -> BoxFuture<Response, S::Error> {
        let codec = self.codec.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let method = req.method().as_str().to_string();
            let path = req.uri().path().to_string();

            if is_exempt(&method, &path) {
                req.extensions_mut().insert(AuthExempt);
                return inner.call(req).await;
            }

            let Some(header) = req
                .headers()
                .get("authorization")
                .and_then(|value| value.to_str().ok())
            else {
                debug!(method, path, "missing authorization header");
                return Ok(error_response(StatusCode::FORBIDDEN, "FORBIDDEN"));
            };

            match codec.parse(header, true) {
                Ok(claims) => {
                    req.extensions_mut().insert(claims);
                    inner.call(req).await
                }
                Err(_) => {
                    debug!(method, path, "credential rejected");
                    Ok(error_response(StatusCode::FORBIDDEN, "FORBIDDEN"))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exemption_table() {
        assert!(is_exempt("POST", "/auth/login"));
        assert!(is_exempt("POST", "/auth/refresh"));
        assert!(is_exempt("POST", "/auth/reset-password"));
        assert!(is_exempt(
            "POST",
            "/auth/reset-password/0c6572f8-9b2e-4e6b-8f47-2a52a4f0beef/validate"
        ));
        assert!(is_exempt("GET", "/health"));

        // Completion is NOT exempt; it needs a reset-scoped credential
        assert!(!is_exempt(
            "POST",
            "/auth/reset-password/0c6572f8-9b2e-4e6b-8f47-2a52a4f0beef/complete"
        ));
        // Method matters
        assert!(!is_exempt("GET", "/auth/login"));
        // Everything else authenticates
        assert!(!is_exempt("GET", "/mfa/devices"));
        assert!(!is_exempt("POST", "/auth/mfa/verify"));
    }

    #[test]
    fn test_exemption_rejects_sloppy_paths() {
        assert!(!is_exempt("POST", "/auth/login/"));
        assert!(!is_exempt("POST", "//auth/login"));
    }
}
