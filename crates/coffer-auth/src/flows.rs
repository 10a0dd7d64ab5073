//! Auth state machine: the top-level flows composing the codec, vault,
//! registry store, and verification cache.
//!
//! Login and MFA verification fold every failure cause into the same error
//! so callers cannot probe for account existence. The password-reset request
//! is enumeration-safe: unknown emails succeed with no side effect.

use std::sync::Arc;

use chrono::Utc;
use coffer_crypto::{totp, SecretVault};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::VerificationCache;
use crate::config::AuthConfig;
use crate::error::{AuthError, Result};
use crate::notify::{dispatch, Notification, Notifier};
use crate::store::AuthStore;
use crate::token::{Audience, Claims, IssueOptions, SessionTokens, TokenCodec, VerifyGrant};
use crate::types::{Challenge, ChallengeKind, MfaDevice, User};

/// Outcome of a login attempt.
#[derive(Debug)]
pub enum LoginGrant {
    /// Password accepted, second factor outstanding. Carries an
    /// `auth:mfa:login` credential; no refresh token is issued yet.
    MfaRequired {
        /// The restricted hold credential
        token: String,
    },
    /// Fully authenticated session.
    Session(SessionTokens),
}

/// Outcome of a successful reset-code validation.
#[derive(Debug)]
pub struct ResetValidation {
    /// Whether the user still has to pass MFA before completing the reset
    pub mfa_required: bool,
    /// The `auth:mfa:password-reset` credential, challenge-bound
    pub token: String,
}

/// The auth flow service.
pub struct AuthFlows {
    store: Arc<AuthStore>,
    cache: Arc<dyn VerificationCache>,
    vault: Arc<SecretVault>,
    codec: Arc<TokenCodec>,
    notifier: Arc<dyn Notifier>,
    config: AuthConfig,
}

impl AuthFlows {
    /// Build the flow service from its collaborators.
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

    fn email_domain_allowed(&self, email: &str) -> bool {
        if self.config.allowed_email_domains.is_empty() {
            return true;
        }
        let Some((_, domain)) = email.rsplit_once('@') else {
            return false;
        };
        if domain.is_empty() {
            return false;
        }
        self.config
            .allowed_email_domains
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(domain))
    }

    /// Password login against the local provider.
    ///
    /// Unknown email, wrong password, disabled provider, and disallowed
    /// domain are indistinguishable to the caller.
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginGrant> {
        if !self.config.local_provider_enabled || !self.email_domain_allowed(email) {
            return Err(AuthError::InvalidCredentials);
        }

        let user = self
            .store
            .find_user_by_email(email)
            .await?
            .filter(User::is_local)
            .ok_or(AuthError::InvalidCredentials)?;
        let hash = user
            .password_hash
            .as_deref()
            .ok_or(AuthError::InvalidCredentials)?;
        if !coffer_crypto::verify_password(password, hash) {
            warn!(user_id = %user.id, "login failed");
            return Err(AuthError::InvalidCredentials);
        }

        let devices = self.store.verified_devices(user.id).await?;
        if !devices.is_empty() || self.config.mfa_required {
            let token = self.codec.issue(
                Audience::MfaLogin,
                &user,
                IssueOptions {
                    provider: user.provider.clone(),
                    mfa_verified: false,
                    challenge_id: None,
                },
            )?;
            info!(user_id = %user.id, "login accepted, MFA outstanding");
            return Ok(LoginGrant::MfaRequired { token });
        }

        info!(user_id = %user.id, "login accepted");
        Ok(LoginGrant::Session(self.codec.issue_session(
            &user,
            &user.provider,
            false,
        )?))
    }

    /// Select which device a verification targets: the named one if given
    /// and verified, else the default, else the first verified device.
    fn select_device(devices: &[MfaDevice], device_id: Option<Uuid>) -> Result<&MfaDevice> {
        if let Some(id) = device_id {
            return devices
                .iter()
                .find(|d| d.id == id)
                .ok_or(AuthError::DeviceNotFound);
        }
        devices
            .iter()
            .find(|d| d.is_default)
            .or_else(|| devices.first())
            .ok_or(AuthError::MfaNotEnabled)
    }

    /// MFA verification under an `auth:mfa:login` or `auth:mfa:password-reset`
    /// hold (already decoded by the middleware).
    pub async fn verify_mfa(
        &self,
        claims: &Claims,
        device_id: Option<Uuid>,
        code: &str,
    ) -> Result<VerifyGrant> {
        let user_id = claims.user_id;
        let user = self
            .store
            .find_user(user_id)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        let devices = self.store.verified_devices(user_id).await?;
        if devices.is_empty() {
            return Err(AuthError::MfaNotEnabled);
        }

        if self.cache.attempts(user_id).await? >= self.config.mfa_max_attempts {
            warn!(user_id = %user_id, "MFA verification rate limited");
            return Err(AuthError::RateLimited);
        }

        let device = Self::select_device(&devices, device_id)?;
        let secret = self.vault.decrypt(&device.encrypted_secret)?;
        if !totp::validate(&secret, code) {
            self.cache.increment_attempts(user_id).await?;
            debug!(user_id = %user_id, device_id = %device.id, "MFA code rejected");
            return Err(AuthError::InvalidCode);
        }

        // A replayed code fails exactly like a wrong one
        if !self.cache.mark_code_used(device.id, code).await? {
            return Err(AuthError::InvalidCode);
        }

        self.store
            .touch_device_last_used(device.id, Utc::now())
            .await?;
        self.cache.reset_attempts(user_id).await?;
        info!(user_id = %user_id, device_id = %device.id, "MFA verified");

        // A reset-scoped hold is re-issued in place; it must NEVER widen
        // into a session pair here.
        if claims.audience() == Some(Audience::MfaPasswordReset) {
            let token = self.codec.issue(
                Audience::MfaPasswordReset,
                &user,
                IssueOptions {
                    provider: claims.provider.clone(),
                    mfa_verified: true,
                    challenge_id: claims.challenge_id,
                },
            )?;
            return Ok(VerifyGrant::ResetScoped {
                access_token: token,
            });
        }

        Ok(VerifyGrant::Session(self.codec.issue_session(
            &user,
            &claims.provider,
            true,
        )?))
    }

    /// Begin a password reset. Always succeeds with no payload; unknown or
    /// federated emails produce no side effect at all.
    pub async fn request_password_reset(&self, email: &str) -> Result<()> {
        let Some(user) = self
            .store
            .find_user_by_email(email)
            .await?
            .filter(User::is_local)
        else {
            debug!("password reset requested for unknown email");
            return Ok(());
        };

        let secret = coffer_crypto::generate_challenge_secret();
        let challenge = Challenge::new(
            ChallengeKind::PasswordReset,
            user.id,
            coffer_crypto::hash_password(&secret)?,
            Utc::now() + self.config.challenge_ttl(),
            self.config.challenge_max_attempts,
        );
        self.store.replace_challenge(&challenge).await?;

        info!(user_id = %user.id, challenge_id = %challenge.id, "password reset challenge created");

        // The plaintext code leaves the process only through the notifier
        dispatch(
            self.notifier.clone(),
            Notification::PasswordResetCode {
                email: user.email,
                code: secret,
            },
        );
        Ok(())
    }

    /// Validate a submitted reset code against its challenge, under the
    /// challenge row's write lock.
    pub async fn validate_reset_code(
        &self,
        challenge_id: Uuid,
        code: &str,
    ) -> Result<ResetValidation> {
        let mut tx = self.store.begin().await?;
        let challenge = self
            .store
            .challenge_for_update(&mut tx, ChallengeKind::PasswordReset, challenge_id)
            .await?
            .ok_or(AuthError::ChallengeInvalid)?;

        if challenge.is_expired(Utc::now()) {
            self.store.delete_challenge(&mut tx, challenge_id).await?;
            tx.commit().await?;
            debug!(challenge_id = %challenge_id, "expired challenge deleted on load");
            return Err(AuthError::ChallengeExpired);
        }

        let submitted = code.trim().to_uppercase();
        if !coffer_crypto::verify_password(&submitted, &challenge.secret_hash) {
            let remaining = challenge.attempts_left - 1;
            if remaining <= 0 {
                self.store.delete_challenge(&mut tx, challenge_id).await?;
                tx.commit().await?;
                warn!(challenge_id = %challenge_id, "challenge locked out");
                return Err(AuthError::ChallengeLocked);
            }
            self.store
                .set_challenge_attempts(&mut tx, challenge_id, remaining)
                .await?;
            tx.commit().await?;
            return Err(AuthError::WrongCode);
        }

        // Correct code: the challenge survives until completion consumes it
        tx.commit().await?;

        let user = self
            .store
            .find_user(challenge.user_id)
            .await?
            .ok_or(AuthError::ChallengeInvalid)?;
        let devices = self.store.verified_devices(user.id).await?;

        let token = self.codec.issue(
            Audience::MfaPasswordReset,
            &user,
            IssueOptions {
                provider: user.provider.clone(),
                mfa_verified: false,
                challenge_id: Some(challenge_id),
            },
        )?;

        info!(user_id = %user.id, challenge_id = %challenge_id, "reset code validated");
        Ok(ResetValidation {
            mfa_required: !devices.is_empty(),
            token,
        })
    }

    /// Complete a password reset under a verified `auth:mfa:password-reset`
    /// credential.
    pub async fn complete_password_reset(
        &self,
        claims: &Claims,
        challenge_id: Uuid,
        new_password: &str,
    ) -> Result<SessionTokens> {
        // The credential is bound to exactly one challenge
        if claims.challenge_id != Some(challenge_id) {
            return Err(AuthError::ChallengeInvalid);
        }

        let challenge = self
            .store
            .get_challenge(ChallengeKind::PasswordReset, challenge_id)
            .await?
            .ok_or(AuthError::ChallengeInvalid)?;
        if challenge.is_expired(Utc::now()) {
            return Err(AuthError::ChallengeExpired);
        }

        let user = self
            .store
            .find_user(challenge.user_id)
            .await?
            .ok_or(AuthError::ChallengeInvalid)?;

        // MFA-bypass guard: an enrolled user must have passed MFA on this
        // credential before the password can change
        let devices = self.store.verified_devices(user.id).await?;
        if !devices.is_empty() && !claims.mfa {
            warn!(user_id = %user.id, "password reset blocked by MFA guard");
            return Err(AuthError::MfaRequired);
        }

        let hash = coffer_crypto::hash_password(new_password)?;
        let mut tx = self.store.begin().await?;
        self.store.update_password(&mut tx, user.id, &hash).await?;
        self.store.delete_challenge(&mut tx, challenge_id).await?;
        tx.commit().await?;

        info!(user_id = %user.id, "password reset completed");
        dispatch(
            self.notifier.clone(),
            Notification::PasswordResetSucceeded { email: user.email.clone() },
        );

        self.codec.issue_session(&user, &user.provider, claims.mfa)
    }

    /// Exchange a refresh credential for a fresh `app:*`. Refresh tokens are
    /// not rotated; their expiry bounds the session.
    pub async fn refresh(&self, refresh_token: &str) -> Result<String> {
        let claims = self.codec.parse_refresh(refresh_token)?;
        let user = self
            .store
            .find_user(claims.user_id)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        self.codec.issue(
            Audience::App,
            &user,
            IssueOptions {
                provider: claims.provider,
                mfa_verified: claims.mfa,
                challenge_id: None,
            },
        )
    }

    /// Parse a raw credential for the verify endpoint; signature/expiry/
    /// issuer checks only. Failures render as 401 rather than 403 on this
    /// path.
    pub fn inspect_token(&self, raw: &str) -> Result<Claims> {
        self.codec
            .parse(raw, false)
            .map_err(|_| AuthError::InvalidCredentials)
    }
}

#[cfg(test)]
mod tests;
