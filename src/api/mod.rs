//! HTTP API for the auth core
//!
//! Provides the `/auth/*` flow endpoints and the `/mfa/devices*` device
//! registry endpoints. Every failure renders as `{"error": CODE}` with the
//! status class from the core's error taxonomy.

pub mod auth;
pub mod health;
pub mod mfa;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use coffer_auth::{AuthError, SessionTokens, VerifyGrant};
use serde::Serialize;
use tracing::error;

pub use auth::auth_routes;
pub use health::health_routes;
pub use mfa::mfa_routes;

/// Create the API router with all endpoints
pub fn api_router() -> Router {
    Router::new()
        .merge(auth_routes())
        .merge(mfa_routes())
        .merge(health_routes())
}

/// The uniform JSON error body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Stable error code
    pub error: &'static str,
}

/// Build an error response. Shared with the middleware stages.
pub fn error_response(status: StatusCode, code: &'static str) -> Response {
    (status, Json(ErrorBody { error: code })).into_response()
}

/// Wrapper mapping core errors onto HTTP responses.
pub struct ApiError(pub AuthError);

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let AuthError::Internal(ref msg) = self.0 {
            error!(error = %msg, "internal error surfaced to client");
        }
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        error_response(status, self.0.code())
    }
}

/// Result alias for handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Token response for verification grants: a full session pair, or a single
/// reset-scoped bearer with no refresh token.
#[derive(Debug, Serialize)]
pub struct TokenResponse {
    /// Bearer credential
    pub access_token: String,
    /// Refresh credential; absent for reset-scoped grants
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl From<VerifyGrant> for TokenResponse {
    fn from(grant: VerifyGrant) -> Self {
        match grant {
            VerifyGrant::Session(SessionTokens {
                access_token,
                refresh_token,
            }) => Self {
                access_token,
                refresh_token: Some(refresh_token),
            },
            VerifyGrant::ResetScoped { access_token } => Self {
                access_token,
                refresh_token: None,
            },
        }
    }
}
