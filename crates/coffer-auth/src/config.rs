//! Auth core configuration contract.
//!
//! The closed set of tunable parameters the core consumes. Loaded from the
//! application TOML by the shell; validated once at startup. The signing
//! secret and encryption key are immutable for the life of the process.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use coffer_crypto::KEY_LEN;

/// Configuration validation errors. All of these are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The JWT signing secret is missing or empty
    #[error("jwt_secret must not be empty")]
    MissingJwtSecret,

    /// The MFA encryption key has the wrong length
    #[error("mfa_encryption_key must be exactly {KEY_LEN} bytes, got {0}")]
    BadKeyLength(usize),

    /// A numeric parameter is outside its allowed range
    #[error("{field} out of range: {value} (allowed {min}..={max})")]
    OutOfRange {
        /// Parameter name
        field: &'static str,
        /// Configured value
        value: u64,
        /// Minimum allowed
        min: u64,
        /// Maximum allowed
        max: u64,
    },
}

/// Auth core parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for token signing. Never logged or echoed in errors.
    /// May also arrive via environment override; empty is fatal at startup.
    #[serde(default)]
    pub jwt_secret: String,
    /// Key for TOTP secret encryption at rest; exactly 32 bytes.
    #[serde(default)]
    pub mfa_encryption_key: String,
    /// Require MFA for every local user regardless of enrollment
    #[serde(default)]
    pub mfa_required: bool,
    /// Whether password login against the local provider is enabled
    #[serde(default = "default_true")]
    pub local_provider_enabled: bool,
    /// Email domains accepted for local login; empty allows any domain
    #[serde(default)]
    pub allowed_email_domains: Vec<String>,
    /// Issuer claim stamped into every credential
    #[serde(default = "default_issuer")]
    pub issuer: String,
    /// `app:*` credential lifetime in minutes (1..=1440)
    #[serde(default = "default_access_token_expiry_minutes")]
    pub access_token_expiry_minutes: u64,
    /// `auth:refresh` credential lifetime in minutes (1..=43200)
    #[serde(default = "default_refresh_token_expiry_minutes")]
    pub refresh_token_expiry_minutes: u64,
    /// `auth:mfa:*` credential lifetime in minutes (1..=30)
    #[serde(default = "default_mfa_token_expiry_minutes")]
    pub mfa_token_expiry_minutes: u64,
    /// Password-reset challenge lifetime in minutes
    #[serde(default = "default_challenge_expiry_minutes")]
    pub challenge_expiry_minutes: u64,
    /// Attempts before a password-reset challenge locks
    #[serde(default = "default_challenge_max_attempts")]
    pub challenge_max_attempts: u32,
    /// MFA verification attempts per window before rate limiting
    #[serde(default = "default_mfa_max_attempts")]
    pub mfa_max_attempts: u32,
    /// MFA attempt counter window in minutes
    #[serde(default = "default_mfa_attempts_window_minutes")]
    pub mfa_attempts_window_minutes: u64,
    /// Maximum MFA devices per user
    #[serde(default = "default_max_mfa_devices_per_user")]
    pub max_mfa_devices_per_user: u32,
}

fn default_true() -> bool {
    true
}
fn default_issuer() -> String {
    "coffer".to_string()
}
fn default_access_token_expiry_minutes() -> u64 {
    60
}
fn default_refresh_token_expiry_minutes() -> u64 {
    600
}
fn default_mfa_token_expiry_minutes() -> u64 {
    5
}
fn default_challenge_expiry_minutes() -> u64 {
    15
}
fn default_challenge_max_attempts() -> u32 {
    5
}
fn default_mfa_max_attempts() -> u32 {
    5
}
fn default_mfa_attempts_window_minutes() -> u64 {
    15
}
fn default_max_mfa_devices_per_user() -> u32 {
    5
}

impl AuthConfig {
    /// Validate the configuration. Any error here aborts startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt_secret.is_empty() {
            return Err(ConfigError::MissingJwtSecret);
        }
        let key_len = self.mfa_encryption_key.as_bytes().len();
        if key_len != KEY_LEN {
            return Err(ConfigError::BadKeyLength(key_len));
        }
        range(
            "access_token_expiry_minutes",
            self.access_token_expiry_minutes,
            1,
            1440,
        )?;
        range(
            "refresh_token_expiry_minutes",
            self.refresh_token_expiry_minutes,
            1,
            43200,
        )?;
        range(
            "mfa_token_expiry_minutes",
            self.mfa_token_expiry_minutes,
            1,
            30,
        )?;
        range(
            "challenge_expiry_minutes",
            self.challenge_expiry_minutes,
            1,
            1440,
        )?;
        Ok(())
    }

    /// The encryption key as raw bytes.
    pub fn encryption_key(&self) -> &[u8] {
        self.mfa_encryption_key.as_bytes()
    }

    /// MFA attempt window in seconds (cache TTL).
    pub fn attempts_window_secs(&self) -> u64 {
        self.mfa_attempts_window_minutes * 60
    }

    /// Challenge lifetime as a chrono duration.
    pub fn challenge_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.challenge_expiry_minutes as i64)
    }
}

fn range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

#[cfg(test)]
impl AuthConfig {
    /// A valid configuration for unit tests across the crate.
    pub(crate) fn for_tests() -> Self {
        Self {
            jwt_secret: "test-signing-secret-with-enough-entropy".to_string(),
            mfa_encryption_key: "0123456789abcdef0123456789abcdef".to_string(),
            mfa_required: false,
            local_provider_enabled: true,
            allowed_email_domains: Vec::new(),
            issuer: default_issuer(),
            access_token_expiry_minutes: default_access_token_expiry_minutes(),
            refresh_token_expiry_minutes: default_refresh_token_expiry_minutes(),
            mfa_token_expiry_minutes: default_mfa_token_expiry_minutes(),
            challenge_expiry_minutes: default_challenge_expiry_minutes(),
            challenge_max_attempts: default_challenge_max_attempts(),
            mfa_max_attempts: default_mfa_max_attempts(),
            mfa_attempts_window_minutes: default_mfa_attempts_window_minutes(),
            max_mfa_devices_per_user: default_max_mfa_devices_per_user(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AuthConfig {
        AuthConfig::for_tests()
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_empty_secret_rejected() {
        let mut cfg = valid();
        cfg.jwt_secret = String::new();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MissingJwtSecret)
        ));
    }

    #[test]
    fn test_key_length_enforced() {
        let mut cfg = valid();
        cfg.mfa_encryption_key = "short".to_string();
        assert!(matches!(cfg.validate(), Err(ConfigError::BadKeyLength(5))));
    }

    #[test]
    fn test_expiry_ranges_enforced() {
        let mut cfg = valid();
        cfg.access_token_expiry_minutes = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.mfa_token_expiry_minutes = 31;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_defaults_from_toml() {
        let cfg: AuthConfig = serde_json::from_value(serde_json::json!({
            "jwt_secret": "s3cret-s3cret-s3cret-s3cret",
            "mfa_encryption_key": "0123456789abcdef0123456789abcdef",
        }))
        .unwrap();
        assert_eq!(cfg.access_token_expiry_minutes, 60);
        assert_eq!(cfg.refresh_token_expiry_minutes, 600);
        assert_eq!(cfg.mfa_token_expiry_minutes, 5);
        assert_eq!(cfg.mfa_max_attempts, 5);
        assert!(!cfg.mfa_required);
        assert!(cfg.local_provider_enabled);
    }
}
