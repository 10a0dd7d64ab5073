//! Token codec: the system's only unit of client-held authority.
//!
//! Credentials are compact JWTs signed with an HMAC-SHA secret. The codec
//! checks signature, expiry, and issuer; audience enforcement is the
//! middleware's concern and deliberately not done in [`TokenCodec::parse`].

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::error::{AuthError, Result};
use crate::types::{Role, User};

/// The closed set of credential kinds, keyed by audience literal.
///
/// Unknown audiences on incoming credentials are never representable here;
/// they fail [`Claims::audience`] and the middleware refuses them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Audience {
    /// Full access to authorized routes
    App,
    /// May only request a new `app:*` credential
    Refresh,
    /// Post-password hold: device listing, first enrollment, MFA verification
    MfaLogin,
    /// Post-reset-code hold: MFA verification and reset completion
    MfaPasswordReset,
}

impl Audience {
    /// The audience literal carried in the `aud` claim.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::App => "app:*",
            Self::Refresh => "auth:refresh",
            Self::MfaLogin => "auth:mfa:login",
            Self::MfaPasswordReset => "auth:mfa:password-reset",
        }
    }

    /// Parse an audience literal. Anything outside the closed set is `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "app:*" => Some(Self::App),
            "auth:refresh" => Some(Self::Refresh),
            "auth:mfa:login" => Some(Self::MfaLogin),
            "auth:mfa:password-reset" => Some(Self::MfaPasswordReset),
            _ => None,
        }
    }

    /// Whether this is one of the restricted transitional audiences.
    pub fn is_restricted(&self) -> bool {
        matches!(self, Self::MfaLogin | Self::MfaPasswordReset)
    }
}

impl std::fmt::Display for Audience {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signed claims carried by every credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Issuer constant
    pub iss: String,
    /// Audience literal (see [`Audience`])
    pub aud: String,
    /// Issued-at, unix seconds
    pub iat: i64,
    /// Expiry, unix seconds
    pub exp: i64,
    /// Subject user id
    pub user_id: Uuid,
    /// Subject email
    pub email: String,
    /// Subject role
    pub role: Role,
    /// Identity provider name
    pub provider: String,
    /// Whether a second factor was verified for this credential
    pub mfa: bool,
    /// Bound challenge; present only on password-reset-scoped credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge_id: Option<Uuid>,
}

impl Claims {
    /// The typed audience, if the literal is in the closed set.
    pub fn audience(&self) -> Option<Audience> {
        Audience::parse(&self.aud)
    }
}

/// Options for credential issuance.
#[derive(Debug, Clone)]
pub struct IssueOptions {
    /// Provider name to stamp into the claims
    pub provider: String,
    /// Whether MFA was verified
    pub mfa_verified: bool,
    /// Challenge binding; only honored for password-reset-scoped credentials
    pub challenge_id: Option<Uuid>,
}

/// An `app:*` + `auth:refresh` pair issued after full authentication.
#[derive(Debug, Clone, Serialize)]
pub struct SessionTokens {
    /// The `app:*` credential
    pub access_token: String,
    /// The `auth:refresh` credential
    pub refresh_token: String,
}

/// Outcome of a successful MFA verification: either a full session or a
/// re-issued reset-scoped hold, depending on the audience presented.
#[derive(Debug, Clone)]
pub enum VerifyGrant {
    /// Full session pair
    Session(SessionTokens),
    /// Reset-scoped credential with `mfa = true` and the challenge preserved
    ResetScoped {
        /// The re-issued `auth:mfa:password-reset` credential
        access_token: String,
    },
}

/// Signs and verifies bearer credentials.
pub struct TokenCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
    mfa_ttl: Duration,
}

impl TokenCodec {
    /// Build a codec from the validated configuration.
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            issuer: config.issuer.clone(),
            access_ttl: Duration::minutes(config.access_token_expiry_minutes as i64),
            refresh_ttl: Duration::minutes(config.refresh_token_expiry_minutes as i64),
            mfa_ttl: Duration::minutes(config.mfa_token_expiry_minutes as i64),
        }
    }

    fn ttl_for(&self, aud: Audience) -> Duration {
        match aud {
            Audience::App => self.access_ttl,
            Audience::Refresh => self.refresh_ttl,
            Audience::MfaLogin | Audience::MfaPasswordReset => self.mfa_ttl,
        }
    }

    /// Issue a credential of the given kind for a user.
    ///
    /// The challenge-id option is attached only to password-reset-scoped
    /// credentials; for every other kind it is dropped.
    pub fn issue(&self, aud: Audience, user: &User, opts: IssueOptions) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            iss: self.issuer.clone(),
            aud: aud.as_str().to_string(),
            iat: now.timestamp(),
            exp: (now + self.ttl_for(aud)).timestamp(),
            user_id: user.id,
            email: user.email.clone(),
            role: user.role,
            provider: opts.provider,
            mfa: opts.mfa_verified,
            challenge_id: if aud == Audience::MfaPasswordReset {
                opts.challenge_id
            } else {
                None
            },
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::Internal(format!("token encoding failed: {}", e)))
    }

    /// Issue the full `app:*` + `auth:refresh` pair.
    pub fn issue_session(
        &self,
        user: &User,
        provider: &str,
        mfa_verified: bool,
    ) -> Result<SessionTokens> {
        let opts = IssueOptions {
            provider: provider.to_string(),
            mfa_verified,
            challenge_id: None,
        };
        Ok(SessionTokens {
            access_token: self.issue(Audience::App, user, opts.clone())?,
            refresh_token: self.issue(Audience::Refresh, user, opts)?,
        })
    }

    /// Parse and verify a credential.
    ///
    /// Checks signature (HMAC-SHA family only), expiry, and issuer. Audience
    /// is NOT checked here; the middleware's scope stage owns that. Any
    /// failure collapses to [`AuthError::InvalidCredential`].
    pub fn parse(&self, raw: &str, require_bearer_prefix: bool) -> Result<Claims> {
        let token = if require_bearer_prefix {
            raw.strip_prefix("Bearer ")
                .ok_or(AuthError::InvalidCredential)?
                .trim()
        } else {
            raw.trim()
        };

        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
        validation.validate_aud = false;
        validation.set_issuer(&[&self.issuer]);

        let data = decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|_| AuthError::InvalidCredential)?;
        Ok(data.claims)
    }

    /// Parse a refresh credential: same checks as [`parse`](Self::parse)
    /// plus a hard requirement that the audience is `auth:refresh`.
    pub fn parse_refresh(&self, raw: &str) -> Result<Claims> {
        let claims = self.parse(raw, false)?;
        if claims.audience() != Some(Audience::Refresh) {
            return Err(AuthError::InvalidCredential);
        }
        Ok(claims)
    }
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("issuer", &self.issuer)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}
