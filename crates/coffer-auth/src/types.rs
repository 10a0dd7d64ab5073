//! Domain types for the auth core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Provider name for password-based accounts.
pub const LOCAL_PROVIDER: &str = "local";

/// User role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Platform administrator
    Admin,
    /// Regular user
    User,
    /// Restricted guest
    Guest,
}

impl Role {
    /// Stable string form (matches the serde encoding).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
            Self::Guest => "guest",
        }
    }

    /// Parse from the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Self::Admin),
            "user" => Some(Self::User),
            "guest" => Some(Self::Guest),
            _ => None,
        }
    }
}

/// A platform user. Created and owned externally; the core only reads it and
/// updates the password hash and device set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Stable opaque identifier
    pub id: Uuid,
    /// Email address
    pub email: String,
    /// Role
    pub role: Role,
    /// Identity provider name (`local` for password accounts)
    pub provider: String,
    /// Argon2id hash; absent for federated accounts
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Whether this account authenticates against the local provider.
    pub fn is_local(&self) -> bool {
        self.provider == LOCAL_PROVIDER
    }
}

/// Second-factor device type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Time-based one-time password (authenticator app)
    Totp,
}

impl DeviceKind {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Totp => "totp",
        }
    }

    /// Parse from the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "totp" => Some(Self::Totp),
            _ => None,
        }
    }
}

/// An MFA device owned by one user.
///
/// Lifecycle: created `Pending` (`is_verified = false`), becomes `Active` on
/// first successful code verification, may carry the per-user `is_default`
/// flag only while active.
#[derive(Debug, Clone)]
pub struct MfaDevice {
    /// Opaque device id
    pub id: Uuid,
    /// Owning user
    pub user_id: Uuid,
    /// Human name, unique per user
    pub name: String,
    /// Device type
    pub kind: DeviceKind,
    /// Vault-encrypted TOTP secret; the plaintext is emitted exactly once at
    /// enrollment and never again
    pub encrypted_secret: String,
    /// Whether the device completed verification
    pub is_verified: bool,
    /// Whether this is the user's default second factor
    pub is_default: bool,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// When verification completed
    pub verified_at: Option<DateTime<Utc>>,
    /// Last successful use
    pub last_used_at: Option<DateTime<Utc>>,
}

impl MfaDevice {
    /// A device authorizes operations only once verified.
    pub fn is_active(&self) -> bool {
        self.is_verified
    }
}

/// Serializable device view for API responses. Never carries the secret.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    /// Device id
    pub id: Uuid,
    /// Human name
    pub name: String,
    /// Device type
    pub kind: DeviceKind,
    /// Whether verified
    pub is_verified: bool,
    /// Whether the default second factor
    pub is_default: bool,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Verification timestamp
    pub verified_at: Option<DateTime<Utc>>,
    /// Last successful use
    pub last_used_at: Option<DateTime<Utc>>,
}

impl From<&MfaDevice> for DeviceView {
    fn from(device: &MfaDevice) -> Self {
        Self {
            id: device.id,
            name: device.name.clone(),
            kind: device.kind,
            is_verified: device.is_verified,
            is_default: device.is_default,
            created_at: device.created_at,
            verified_at: device.verified_at,
            last_used_at: device.last_used_at,
        }
    }
}

/// Challenge kind. Password reset today; invites use the same machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    /// Password-reset flow
    PasswordReset,
    /// Invitation flow
    Invite,
}

impl ChallengeKind {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PasswordReset => "password_reset",
            Self::Invite => "invite",
        }
    }

    /// Parse from the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "password_reset" => Some(Self::PasswordReset),
            "invite" => Some(Self::Invite),
            _ => None,
        }
    }
}

/// A single-use, bounded-attempt token binding a hashed secret to an action.
///
/// At most one active challenge exists per (user, kind); creating a new one
/// replaces prior ones. The challenge ceases to exist once consumed or once
/// `attempts_left` reaches zero.
#[derive(Debug, Clone)]
pub struct Challenge {
    /// Challenge id (appears in reset URLs and reset-scoped credentials)
    pub id: Uuid,
    /// Challenge kind
    pub kind: ChallengeKind,
    /// Target user
    pub user_id: Uuid,
    /// Salted hash of the human-entered secret
    pub secret_hash: String,
    /// Hard expiry
    pub expires_at: DateTime<Utc>,
    /// Remaining submissions before lockout
    pub attempts_left: i32,
}

impl Challenge {
    /// Build a fresh challenge.
    pub fn new(
        kind: ChallengeKind,
        user_id: Uuid,
        secret_hash: String,
        expires_at: DateTime<Utc>,
        attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            user_id,
            secret_hash,
            expires_at,
            attempts_left: attempts as i32,
        }
    }

    /// Whether the challenge is past its expiry at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
