//! Error types for the auth core.
//!
//! Every failure the state machine can surface maps to a stable HTTP status
//! and response code through [`AuthError::http_status`] and
//! [`AuthError::code`]. The HTTP shell does the final axum conversion; this
//! crate stays transport-free.

use thiserror::Error;

use crate::cache::CacheError;

/// Auth core error taxonomy.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Login failed. Deliberately covers unknown email, wrong password, and
    /// disabled provider alike so callers cannot tell them apart.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Presented bearer credential failed signature, expiry, issuer, or
    /// structural checks.
    #[error("invalid credential")]
    InvalidCredential,

    /// Credential audience not allowed for this operation, or MFA
    /// enforcement refused the request.
    #[error("forbidden")]
    Forbidden,

    /// Too many MFA verification attempts in the window.
    #[error("too many verification attempts")]
    RateLimited,

    /// TOTP code rejected. Also returned for replayed codes so the caller
    /// cannot distinguish a replay from a wrong guess.
    #[error("invalid mfa code")]
    InvalidCode,

    /// Password-reset code did not match; attempts remain.
    #[error("wrong code")]
    WrongCode,

    /// Password-reset challenge exhausted its attempts.
    #[error("challenge locked")]
    ChallengeLocked,

    /// Challenge absent, mismatched, or otherwise unusable.
    #[error("challenge invalid")]
    ChallengeInvalid,

    /// Challenge past its expiry.
    #[error("challenge expired")]
    ChallengeExpired,

    /// Password-reset completion attempted without MFA verification by a
    /// user who has an active second factor.
    #[error("mfa verification required")]
    MfaRequired,

    /// MFA verification requested but the user has no active device.
    #[error("mfa not enabled")]
    MfaNotEnabled,

    /// Device limit reached for this user.
    #[error("device limit reached")]
    MaxDevicesReached,

    /// Device name already taken for this user.
    #[error("device name already exists")]
    NameExists,

    /// Scope-restricted enrollment is only permitted before the first
    /// device becomes active.
    #[error("mfa setup restricted")]
    RestrictedSetupOnly,

    /// Device does not exist or is not owned by the caller.
    #[error("device not found")]
    DeviceNotFound,

    /// Device is already verified.
    #[error("device already verified")]
    AlreadyVerified,

    /// Device is not verified yet (e.g. promotion of a pending device).
    #[error("device not verified")]
    NotVerified,

    /// Verification cache unreachable; callers fail closed.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Internal error (database, serialization, crypto).
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// HTTP status the shell should respond with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidCredentials | Self::InvalidCode | Self::WrongCode => 401,
            Self::InvalidCredential
            | Self::Forbidden
            | Self::ChallengeLocked
            | Self::MfaRequired
            | Self::RestrictedSetupOnly => 403,
            Self::RateLimited => 429,
            Self::MfaNotEnabled | Self::MaxDevicesReached | Self::ChallengeInvalid | Self::NotVerified => 400,
            Self::ChallengeExpired => 410,
            Self::NameExists | Self::AlreadyVerified => 409,
            Self::DeviceNotFound => 404,
            Self::ServiceUnavailable(_) => 503,
            Self::Internal(_) => 500,
        }
    }

    /// Stable response code string for the JSON error body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "UNAUTHORIZED",
            Self::InvalidCredential | Self::Forbidden => "FORBIDDEN",
            Self::RateLimited => "MFA_RATE_LIMITED",
            Self::InvalidCode => "INVALID_MFA_CODE",
            Self::WrongCode => "WRONG_CODE",
            Self::ChallengeLocked => "CHALLENGE_LOCKED",
            Self::ChallengeInvalid | Self::ChallengeExpired | Self::NotVerified => "INVALID_REQUEST",
            Self::MfaRequired => "MFA_REQUIRED",
            Self::MfaNotEnabled => "MFA_NOT_ENABLED",
            Self::MaxDevicesReached => "MAX_MFA_DEVICES_REACHED",
            Self::NameExists => "MFA_DEVICE_NAME_EXISTS",
            Self::RestrictedSetupOnly => "MFA_SETUP_RESTRICTED",
            Self::DeviceNotFound => "NOT_FOUND",
            Self::AlreadyVerified => "MFA_DEVICE_ALREADY_VERIFIED",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_SERVER_ERROR",
        }
    }
}

impl From<sqlx::Error> for AuthError {
    fn from(err: sqlx::Error) -> Self {
        Self::Internal(format!("database error: {}", err))
    }
}

impl From<CacheError> for AuthError {
    fn from(err: CacheError) -> Self {
        // Cache failure during verification must fail closed, never allow
        Self::ServiceUnavailable(err.to_string())
    }
}

impl From<coffer_crypto::VaultError> for AuthError {
    fn from(err: coffer_crypto::VaultError) -> Self {
        Self::Internal(format!("vault error: {}", err))
    }
}

/// Result type alias for auth core operations.
pub type Result<T> = std::result::Result<T, AuthError>;
