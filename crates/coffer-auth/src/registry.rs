//! MFA device registry: enroll → verify → (default | secondary) → remove.
//!
//! Invariants enforced here:
//! - at most `max_mfa_devices_per_user` devices per user
//! - device names unique per user (case-sensitive)
//! - at most one verified device per user carries the default flag
//! - a pending device authorizes nothing except its own verification
//! - a successful TOTP code is accepted at most once per device
//!
//! Verification runs inside a store transaction that takes the device row's
//! write lock before any check, so concurrent verifiers of the same device
//! serialize. The rate counter is consulted before the secret is decrypted.

use std::sync::Arc;

use chrono::Utc;
use coffer_crypto::{totp, SecretVault};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::VerificationCache;
use crate::config::AuthConfig;
use crate::error::{AuthError, Result};
use crate::notify::{dispatch, Notification, Notifier};
use crate::store::AuthStore;
use crate::token::{Audience, Claims, IssueOptions, TokenCodec, VerifyGrant};
use crate::types::{DeviceKind, MfaDevice, User};

/// How an enrollment request proved it may add a device.
#[derive(Debug)]
pub enum EnrollmentAuthorization {
    /// Caller holds a restricted `auth:mfa:*` credential. Only permitted
    /// while the user has zero active devices.
    RestrictedByScope,
    /// Caller re-entered their password.
    PasswordVerified(String),
}

/// The one-time enrollment response. The plaintext secret and URI are never
/// emitted again after this.
#[derive(Debug)]
pub struct EnrollmentTicket {
    /// New device id
    pub device_id: Uuid,
    /// Plaintext base32 TOTP secret
    pub secret: String,
    /// `otpauth://` URI for authenticator apps
    pub provisioning_uri: String,
    /// Issuer shown in the authenticator
    pub issuer: String,
}

/// Patch for device updates.
#[derive(Debug, Default)]
pub struct DevicePatch {
    /// New name (uniqueness re-checked)
    pub name: Option<String>,
    /// Default flag change; promotion requires the device to be verified
    pub is_default: Option<bool>,
}

/// The device registry service.
pub struct DeviceRegistry {
    store: Arc<AuthStore>,
    cache: Arc<dyn VerificationCache>,
    vault: Arc<SecretVault>,
    codec: Arc<TokenCodec>,
    notifier: Arc<dyn Notifier>,
    config: AuthConfig,
}

impl DeviceRegistry {
    /// Build the registry from its collaborators.
    pub fn new(
        store: Arc<AuthStore>,
        cache: Arc<dyn VerificationCache>,
        vault: Arc<SecretVault>,
        codec: Arc<TokenCodec>,
        notifier: Arc<dyn Notifier>,
        config: AuthConfig,
    ) -> Self {
        Self {
            store,
            cache,
            vault,
            codec,
            notifier,
            config,
        }
    }

    async fn load_user(&self, user_id: Uuid) -> Result<User> {
        self.store
            .find_user(user_id)
            .await?
            .ok_or(AuthError::InvalidCredentials)
    }

    /// List a user's devices, oldest first.
    pub async fn list(&self, user_id: Uuid) -> Result<Vec<MfaDevice>> {
        self.store.list_devices(user_id).await
    }

    /// Enroll a new device in the pending state.
    pub async fn enroll(
        &self,
        user_id: Uuid,
        name: &str,
        authorization: EnrollmentAuthorization,
    ) -> Result<EnrollmentTicket> {
        let user = self.load_user(user_id).await?;

        if self.store.count_devices(user_id).await? >= self.config.max_mfa_devices_per_user {
            return Err(AuthError::MaxDevicesReached);
        }
        if self.store.device_name_exists(user_id, name, None).await? {
            return Err(AuthError::NameExists);
        }

        match authorization {
            EnrollmentAuthorization::RestrictedByScope => {
                // Restricted credentials may only bootstrap the FIRST factor;
                // pending devices do not count against this.
                if !self.store.verified_devices(user_id).await?.is_empty() {
                    return Err(AuthError::RestrictedSetupOnly);
                }
            }
            EnrollmentAuthorization::PasswordVerified(password) => {
                let hash = user
                    .password_hash
                    .as_deref()
                    .ok_or(AuthError::InvalidCredentials)?;
                if !coffer_crypto::verify_password(&password, hash) {
                    return Err(AuthError::InvalidCredentials);
                }
            }
        }

        let enrollment = totp::generate_enrollment(&self.config.issuer, &user.email);
        let device = MfaDevice {
            id: Uuid::new_v4(),
            user_id,
            name: name.to_string(),
            kind: DeviceKind::Totp,
            encrypted_secret: self.vault.encrypt(&enrollment.secret)?,
            is_verified: false,
            is_default: false,
            created_at: Utc::now(),
            verified_at: None,
            last_used_at: None,
        };
        self.store.insert_device(&device).await?;

        info!(user_id = %user_id, device_id = %device.id, "MFA device enrolled (pending)");

        Ok(EnrollmentTicket {
            device_id: device.id,
            secret: enrollment.secret,
            provisioning_uri: enrollment.provisioning_uri,
            issuer: self.config.issuer.clone(),
        })
    }

    /// Verify a pending device with its first TOTP code.
    ///
    /// The grant depends on the credential the caller presented: a
    /// password-reset hold is re-issued with `mfa = true` and its challenge
    /// binding preserved; anything else receives a full session pair.
    pub async fn verify(&self, claims: &Claims, device_id: Uuid, code: &str) -> Result<VerifyGrant> {
        let user_id = claims.user_id;
        let user = self.load_user(user_id).await?;

        let mut tx = self.store.begin().await?;
        let device = self
            .store
            .device_for_update(&mut tx, user_id, device_id)
            .await?
            .ok_or(AuthError::DeviceNotFound)?;
        if device.is_verified {
            return Err(AuthError::AlreadyVerified);
        }

        // Rate check before the secret is even decrypted
        if self.cache.attempts(user_id).await? >= self.config.mfa_max_attempts {
            warn!(user_id = %user_id, "MFA verification rate limited");
            return Err(AuthError::RateLimited);
        }

        let secret = self.vault.decrypt(&device.encrypted_secret)?;
        if !totp::validate(&secret, code) {
            drop(tx);
            self.cache.increment_attempts(user_id).await?;
            return Err(AuthError::InvalidCode);
        }

        // Replayed codes fail exactly like wrong ones
        if !self.cache.mark_code_used(device_id, code).await? {
            return Err(AuthError::InvalidCode);
        }

        let others = self
            .store
            .count_other_active_defaults(&mut tx, user_id, device_id)
            .await?;
        self.store
            .mark_device_verified(&mut tx, device_id, others == 0, Utc::now())
            .await?;
        self.cache.reset_attempts(user_id).await?;
        tx.commit().await?;

        info!(
            user_id = %user_id,
            device_id = %device_id,
            is_default = others == 0,
            "MFA device verified"
        );

        dispatch(
            self.notifier.clone(),
            Notification::DeviceEnrolled {
                email: user.email.clone(),
                device_name: device.name.clone(),
            },
        );

        match claims.audience() {
            Some(Audience::MfaPasswordReset) => {
                let token = self.codec.issue(
                    Audience::MfaPasswordReset,
                    &user,
                    IssueOptions {
                        provider: claims.provider.clone(),
                        mfa_verified: true,
                        challenge_id: claims.challenge_id,
                    },
                )?;
                Ok(VerifyGrant::ResetScoped {
                    access_token: token,
                })
            }
            _ => Ok(VerifyGrant::Session(self.codec.issue_session(
                &user,
                &claims.provider,
                true,
            )?)),
        }
    }

    /// Rename a device and/or change its default flag.
    pub async fn update(&self, user_id: Uuid, device_id: Uuid, patch: DevicePatch) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let device = self
            .store
            .device_for_update(&mut tx, user_id, device_id)
            .await?
            .ok_or(AuthError::DeviceNotFound)?;

        if let Some(name) = &patch.name {
            if *name != device.name
                && self
                    .store
                    .device_name_exists(user_id, name, Some(device_id))
                    .await?
            {
                return Err(AuthError::NameExists);
            }
            self.store.rename_device(&mut tx, device_id, name).await?;
        }

        match patch.is_default {
            Some(true) => {
                if !device.is_active() {
                    return Err(AuthError::NotVerified);
                }
                // The default is unique per user; swap it atomically
                self.store.clear_default_flags(&mut tx, user_id).await?;
                self.store.set_default_flag(&mut tx, device_id, true).await?;
            }
            Some(false) => {
                self.store
                    .set_default_flag(&mut tx, device_id, false)
                    .await?;
            }
            None => {}
        }

        tx.commit().await?;
        Ok(())
    }

    /// Remove a device. Always requires the user's password, regardless of
    /// which credential authorized the request.
    pub async fn remove(&self, user_id: Uuid, device_id: Uuid, password: &str) -> Result<()> {
        let user = self.load_user(user_id).await?;
        let hash = user
            .password_hash
            .as_deref()
            .ok_or(AuthError::InvalidCredentials)?;
        if !coffer_crypto::verify_password(password, hash) {
            return Err(AuthError::InvalidCredentials);
        }

        let mut tx = self.store.begin().await?;
        let device = self
            .store
            .device_for_update(&mut tx, user_id, device_id)
            .await?
            .ok_or(AuthError::DeviceNotFound)?;

        self.store.delete_device(&mut tx, device_id).await?;

        // Removing the active default promotes the oldest remaining active
        // device; with none left the user simply has no second factor.
        if device.is_active() && device.is_default {
            if let Some(oldest) = self.store.oldest_active_device(&mut tx, user_id).await? {
                self.store.set_default_flag(&mut tx, oldest.id, true).await?;
            }
        }

        tx.commit().await?;
        info!(user_id = %user_id, device_id = %device_id, "MFA device removed");
        Ok(())
    }
}
