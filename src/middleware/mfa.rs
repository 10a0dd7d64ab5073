//! MFA enforcement middleware.
//!
//! Applies only to `app:*` credentials from the local provider. A credential
//! that carries `mfa = true` passes. Otherwise the closed bypass table is
//! consulted (device management stays reachable so users can enroll), then
//! the platform policy, then the registry: a user with an active device and
//! an unverified credential is holding a stale token from before enrollment
//! and is refused.

use axum::{
    http::{Request, StatusCode},
    response::Response,
};
use coffer_auth::{Audience, AuthStore, Claims};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{error, warn};

use crate::api::error_response;
use crate::middleware::auth::AuthExempt;
use crate::middleware::scope::path_matches;

/// Routes an unverified `app:*` credential may still reach. Closed table.
pub const MFA_BYPASS: &[(&str, &str)] = &[
    ("GET", "/mfa/devices"),
    ("POST", "/mfa/devices"),
    ("POST", "/mfa/devices/{uuid}/verify"),
];

fn is_bypass(method: &str, path: &str) -> bool {
    MFA_BYPASS
        .iter()
        .any(|(m, pattern)| *m == method && path_matches(pattern, path))
}

// ============================================================================
// Axum Layer
// ============================================================================

/// MFA enforcement layer.
#[derive(Clone)]
pub struct MfaEnforcementLayer {
    store: Arc<AuthStore>,
    mfa_required: bool,
}

impl MfaEnforcementLayer {
    /// Create the layer.
    pub fn new(store: Arc<AuthStore>, mfa_required: bool) -> Self {
        Self {
            store,
            mfa_required,
        }
    }
}

impl<S> Layer<S> for MfaEnforcementLayer {
    type Service = MfaEnforcementService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MfaEnforcementService {
            inner,
            store: self.store.clone(),
            mfa_required: self.mfa_required,
        }
    }
}

/// MFA enforcement service wrapper.
#[derive(Clone)]
pub struct MfaEnforcementService<S> {
    inner: S,
    store: Arc<AuthStore>,
    mfa_required: bool,
}

type BoxFuture<T, E> =
    std::pin::Pin<Box<dyn std::future::Future<Output = std::result::Result<T, E>> + Send>>;

impl<S, B> Service<Request<B>> for MfaEnforcementService<S>
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
        let store = self.store.clone();
        let mfa_required = self.mfa_required;
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if req.extensions().get::<AuthExempt>().is_some() {
                return inner.call(req).await;
            }

            let Some(claims) = req.extensions().get::<Claims>().cloned() else {
                return Ok(error_response(StatusCode::FORBIDDEN, "FORBIDDEN"));
            };

            // Only full-access local-provider credentials are in scope here;
            // restricted audiences are bounded by the scope stage instead.
            if claims.audience() != Some(Audience::App)
                || claims.provider != coffer_auth::types::LOCAL_PROVIDER
            {
                return inner.call(req).await;
            }

            if claims.mfa {
                return inner.call(req).await;
            }

            let method = req.method().as_str();
            let path = req.uri().path();
            if is_bypass(method, path) {
                return inner.call(req).await;
            }

            if mfa_required {
                warn!(user_id = %claims.user_id, "unverified credential refused (platform MFA policy)");
                return Ok(error_response(StatusCode::FORBIDDEN, "FORBIDDEN"));
            }

            // Stale-token guard: the user enrolled a device after this
            // credential was issued
            match store.verified_devices(claims.user_id).await {
                Ok(devices) if devices.is_empty() => inner.call(req).await,
                Ok(_) => {
                    warn!(user_id = %claims.user_id, "stale unverified credential refused");
                    Ok(error_response(StatusCode::FORBIDDEN, "FORBIDDEN"))
                }
                Err(e) => {
                    error!(error = %e, "device lookup failed during MFA enforcement");
                    Ok(error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_SERVER_ERROR",
                    ))
                }
            }
        })
    }
}
