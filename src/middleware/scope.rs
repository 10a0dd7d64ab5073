//! Audience scope middleware.
//!
//! Consults an ordered, closed route policy table mapping (method, path
//! pattern) to the audiences allowed there; the first match wins. Routes
//! with no declared entry require `app:*`. Unknown audiences on incoming
//! credentials always refuse.

use axum::{
    http::{Request, StatusCode},
    response::Response,
};
use coffer_auth::{Audience, Claims};
use regex::Regex;
use std::sync::LazyLock;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::warn;

use crate::api::error_response;
use crate::middleware::auth::AuthExempt;

/// One row of the route policy table.
pub struct RoutePolicy {
    /// HTTP method
    pub method: &'static str,
    /// Path pattern; `{uuid}` segments match version-4 UUIDs only
    pub pattern: &'static str,
    /// Allowed audiences
    pub audiences: &'static [Audience],
}

/// The closed, ordered scope policy. Everything not listed here requires
/// `app:*`.
pub const SCOPE_POLICY: &[RoutePolicy] = &[
    RoutePolicy {
        method: "POST",
        pattern: "/auth/mfa/verify",
        audiences: &[Audience::MfaLogin, Audience::MfaPasswordReset],
    },
    RoutePolicy {
        method: "POST",
        pattern: "/auth/reset-password/{uuid}/complete",
        audiences: &[Audience::MfaPasswordReset],
    },
    RoutePolicy {
        method: "GET",
        pattern: "/mfa/devices",
        audiences: &[Audience::App, Audience::MfaLogin, Audience::MfaPasswordReset],
    },
    RoutePolicy {
        method: "POST",
        pattern: "/mfa/devices",
        audiences: &[Audience::App, Audience::MfaLogin, Audience::MfaPasswordReset],
    },
    RoutePolicy {
        method: "POST",
        pattern: "/mfa/devices/{uuid}/verify",
        audiences: &[Audience::App, Audience::MfaLogin, Audience::MfaPasswordReset],
    },
];

/// Version-4 UUID, lowercase only. Wrong case or wrong version is a
/// non-match, which surfaces as a policy refusal rather than a 404.
static UUID_V4: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{4}-[0-9a-f]{12}$")
        .expect("uuid regex is valid")
});

/// Match a request path against a pattern.
///
/// Double slashes and trailing slashes never match. `{uuid}` pattern
/// segments require a v4 UUID; other `{...}` segments match any non-empty
/// segment; everything else is an exact comparison.
pub(crate) fn path_matches(pattern: &str, path: &str) -> bool {
    if path.contains("//") || (path.len() > 1 && path.ends_with('/')) {
        return false;
    }

    let pattern_segments: Vec<&str> = pattern.split('/').collect();
    let path_segments: Vec<&str> = path.split('/').collect();
    if pattern_segments.len() != path_segments.len() {
        return false;
    }

    pattern_segments
        .iter()
        .zip(path_segments)
        .all(|(pattern_segment, path_segment)| match *pattern_segment {
            "{uuid}" => UUID_V4.is_match(path_segment),
            s if s.starts_with('{') && s.ends_with('}') => !path_segment.is_empty(),
            s => s == path_segment,
        })
}

/// Audiences declared for a route, if any. First match wins.
pub fn declared_audiences(method: &str, path: &str) -> Option<&'static [Audience]> {
    SCOPE_POLICY
        .iter()
        .find(|policy| policy.method == method && path_matches(policy.pattern, path))
        .map(|policy| policy.audiences)
}

/// Whether the credential's audience may reach this route.
pub fn audience_allowed(method: &str, path: &str, audience: Audience) -> bool {
    match declared_audiences(method, path) {
        Some(allowed) => allowed.contains(&audience),
        None => audience == Audience::App,
    }
}

// ============================================================================
// Axum Layer
// ============================================================================

/// Audience scope layer.
#[derive(Clone, Default)]
pub struct ScopeLayer;

impl<S> Layer<S> for ScopeLayer {
    type Service = ScopeService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ScopeService { inner }
    }
}

/// Audience scope service wrapper.
#[derive(Clone)]
pub struct ScopeService<S> {
    inner: S,
}

type BoxFuture<T, E> =
    std::pin::Pin<Box<dyn std::future::Future<Output = std::result::Result<T, E>> + Send>>;

impl<S, B> Service<Request<B>> for ScopeService<S>
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
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if req.extensions().get::<AuthExempt>().is_some() {
                return inner.call(req).await;
            }

            let Some(claims) = req.extensions().get::<Claims>() else {
                return Ok(error_response(StatusCode::FORBIDDEN, "FORBIDDEN"));
            };

            // Unknown audience literal: always refuse
            let Some(audience) = claims.audience() else {
                warn!(aud = %claims.aud, "credential with unknown audience refused");
                return Ok(error_response(StatusCode::FORBIDDEN, "FORBIDDEN"));
            };

            let method = req.method().as_str();
            let path = req.uri().path();
            if !audience_allowed(method, path, audience) {
                warn!(%audience, method, path, "audience not allowed for route");
                return Ok(error_response(StatusCode::FORBIDDEN, "FORBIDDEN"));
            }

            inner.call(req).await
        })
    }
}
