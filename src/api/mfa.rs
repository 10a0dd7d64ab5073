//! MFA device registry endpoints

use axum::{
    extract::{Extension, Path},
    routing::{get, post},
    Json, Router,
};
use coffer_auth::{
    AuthError, DevicePatch, DeviceRegistry, DeviceView, EnrollmentAuthorization,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::api::{ApiResult, TokenResponse};
use crate::middleware::auth::Principal;

// -----------------------------------------------------------------------------
// Models
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct DeviceListResponse {
    devices: Vec<DeviceView>,
}

#[derive(Debug, Deserialize)]
struct EnrollRequest {
    name: String,
    /// Required when enrolling under a full `app:*` credential; restricted
    /// credentials enroll their first device without it.
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Serialize)]
struct EnrollResponse {
    device_id: Uuid,
    secret: String,
    qr_code_uri: String,
    issuer: String,
}

#[derive(Debug, Deserialize)]
struct VerifyDeviceRequest {
    code: String,
}

#[derive(Debug, Deserialize)]
struct UpdateDeviceRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    is_default: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RemoveDeviceRequest {
    password: String,
}

// -----------------------------------------------------------------------------
// Routes
// -----------------------------------------------------------------------------

pub fn mfa_routes() -> Router {
    Router::new()
        .route("/mfa/devices", get(list_devices).post(enroll_device))
        .route("/mfa/devices/:id/verify", post(verify_device))
        .route(
            "/mfa/devices/:id",
            axum::routing::patch(update_device).delete(remove_device),
        )
}

async fn list_devices(
    Extension(registry): Extension<Arc<DeviceRegistry>>,
    Principal(claims): Principal,
) -> ApiResult<Json<DeviceListResponse>> {
    let devices = registry.list(claims.user_id).await?;
    Ok(Json(DeviceListResponse {
        devices: devices.iter().map(DeviceView::from).collect(),
    }))
}

/// Enroll a device. The plaintext secret and provisioning URI appear in this
/// response exactly once and are never re-emitted.
async fn enroll_device(
    Extension(registry): Extension<Arc<DeviceRegistry>>,
    Principal(claims): Principal,
    Json(body): Json<EnrollRequest>,
) -> ApiResult<Json<EnrollResponse>> {
    let authorization = match claims.audience() {
        Some(audience) if audience.is_restricted() => EnrollmentAuthorization::RestrictedByScope,
        _ => EnrollmentAuthorization::PasswordVerified(
            body.password.ok_or(AuthError::InvalidCredentials)?,
        ),
    };

    let ticket = registry
        .enroll(claims.user_id, &body.name, authorization)
        .await?;
    Ok(Json(EnrollResponse {
        device_id: ticket.device_id,
        secret: ticket.secret,
        qr_code_uri: ticket.provisioning_uri,
        issuer: ticket.issuer,
    }))
}

async fn verify_device(
    Extension(registry): Extension<Arc<DeviceRegistry>>,
    Principal(claims): Principal,
    Path(id): Path<Uuid>,
    Json(body): Json<VerifyDeviceRequest>,
) -> ApiResult<Json<TokenResponse>> {
    let grant = registry.verify(&claims, id, &body.code).await?;
    Ok(Json(grant.into()))
}

async fn update_device(
    Extension(registry): Extension<Arc<DeviceRegistry>>,
    Principal(claims): Principal,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateDeviceRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    registry
        .update(
            claims.user_id,
            id,
            DevicePatch {
                name: body.name,
                is_default: body.is_default,
            },
        )
        .await?;
    Ok(Json(serde_json::json!({})))
}

async fn remove_device(
    Extension(registry): Extension<Arc<DeviceRegistry>>,
    Principal(claims): Principal,
    Path(id): Path<Uuid>,
    Json(body): Json<RemoveDeviceRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    registry.remove(claims.user_id, id, &body.password).await?;
    Ok(Json(serde_json::json!({})))
}
