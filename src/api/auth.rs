//! Authentication flow endpoints
//!
//! Login, token verification, refresh, MFA verification, and the three-step
//! password-reset flow.

use axum::{
    extract::{Extension, Path},
    routing::post,
    Json, Router,
};
use coffer_auth::{AuthFlows, Claims, LoginGrant, ResetValidation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::api::{ApiResult, TokenResponse};
use crate::middleware::auth::Principal;

// -----------------------------------------------------------------------------
// Models
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

/// Login response. In the MFA branch the restricted bearer is carried in
/// `access_token` (canonical) and mirrored in `mfa_token`; no refresh token
/// is issued until the second factor passes.
#[derive(Debug, Serialize)]
struct LoginResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    mfa_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    mfa_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerifyTokenRequest {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

#[derive(Debug, Serialize)]
struct RefreshResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct MfaVerifyRequest {
    code: String,
    #[serde(default)]
    device_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
struct ResetRequest {
    email: String,
}

#[derive(Debug, Deserialize)]
struct ResetValidateRequest {
    code: String,
}

#[derive(Debug, Serialize)]
struct ResetValidateResponse {
    access_token: String,
    mfa_required: bool,
}

#[derive(Debug, Deserialize)]
struct ResetCompleteRequest {
    new_password: String,
}

// -----------------------------------------------------------------------------
// Routes
// -----------------------------------------------------------------------------

pub fn auth_routes() -> Router {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/verify", post(verify_token))
        .route("/auth/refresh", post(refresh))
        .route("/auth/mfa/verify", post(verify_mfa))
        .route("/auth/reset-password", post(request_reset))
        .route("/auth/reset-password/:id/validate", post(validate_reset))
        .route("/auth/reset-password/:id/complete", post(complete_reset))
}

async fn login(
    Extension(flows): Extension<Arc<AuthFlows>>,
    Json(body): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let response = match flows.login(&body.email, &body.password).await? {
        LoginGrant::MfaRequired { token } => LoginResponse {
            access_token: Some(token.clone()),
            refresh_token: None,
            mfa_required: true,
            mfa_token: Some(token),
        },
        LoginGrant::Session(tokens) => LoginResponse {
            access_token: Some(tokens.access_token),
            refresh_token: Some(tokens.refresh_token),
            mfa_required: false,
            mfa_token: None,
        },
    };
    Ok(Json(response))
}

/// Echo the claims of a presented credential, or 401.
async fn verify_token(
    Extension(flows): Extension<Arc<AuthFlows>>,
    Json(body): Json<VerifyTokenRequest>,
) -> ApiResult<Json<Claims>> {
    Ok(Json(flows.inspect_token(&body.access_token)?))
}

async fn refresh(
    Extension(flows): Extension<Arc<AuthFlows>>,
    Json(body): Json<RefreshRequest>,
) -> ApiResult<Json<RefreshResponse>> {
    let access_token = flows.refresh(&body.refresh_token).await?;
    Ok(Json(RefreshResponse { access_token }))
}

async fn verify_mfa(
    Extension(flows): Extension<Arc<AuthFlows>>,
    Principal(claims): Principal,
    Json(body): Json<MfaVerifyRequest>,
) -> ApiResult<Json<TokenResponse>> {
    let grant = flows
        .verify_mfa(&claims, body.device_id, &body.code)
        .await?;
    Ok(Json(grant.into()))
}

/// Always responds with an empty object, whether or not the email exists.
async fn request_reset(
    Extension(flows): Extension<Arc<AuthFlows>>,
    Json(body): Json<ResetRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    flows.request_password_reset(&body.email).await?;
    Ok(Json(serde_json::json!({})))
}

async fn validate_reset(
    Extension(flows): Extension<Arc<AuthFlows>>,
    Path(id): Path<Uuid>,
    Json(body): Json<ResetValidateRequest>,
) -> ApiResult<Json<ResetValidateResponse>> {
    let ResetValidation {
        mfa_required,
        token,
    } = flows.validate_reset_code(id, &body.code).await?;
    Ok(Json(ResetValidateResponse {
        access_token: token,
        mfa_required,
    }))
}

async fn complete_reset(
    Extension(flows): Extension<Arc<AuthFlows>>,
    Principal(claims): Principal,
    Path(id): Path<Uuid>,
    Json(body): Json<ResetCompleteRequest>,
) -> ApiResult<Json<TokenResponse>> {
    let tokens = flows
        .complete_password_reset(&claims, id, &body.new_password)
        .await?;
    Ok(Json(TokenResponse {
        access_token: tokens.access_token,
        refresh_token: Some(tokens.refresh_token),
    }))
}
