use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use coffer_crypto::{totp, SecretVault};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::cache::MemoryCache;
use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::flows::{AuthFlows, LoginGrant, ResetValidation};
use crate::notify::{Notification, Notifier, NotifyError};
use crate::store::AuthStore;
use crate::token::{Audience, Claims, TokenCodec, VerifyGrant};
use crate::types::{Challenge, ChallengeKind, DeviceKind, MfaDevice, Role, User, LOCAL_PROVIDER};

/// Captures published events so tests can observe the reset code.
struct RecordingNotifier {
    events: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    async fn wait_for_event(&self) -> Option<Notification> {
        // Dispatch is fire-and-forget; give the spawned task a few beats
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            let events = self.events.lock().await;
            if let Some(event) = events.last() {
                return Some(event.clone());
            }
        }
        None
    }

    async fn count(&self) -> usize {
        self.events.lock().await.len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn publish(&self, event: Notification) -> Result<(), NotifyError> {
        self.events.lock().await.push(event);
        Ok(())
    }
}

struct TestContext {
    flows: AuthFlows,
    store: Arc<AuthStore>,
    vault: Arc<SecretVault>,
    codec: Arc<TokenCodec>,
    notifier: Arc<RecordingNotifier>,
}

async fn context() -> TestContext {
    context_with(AuthConfig::for_tests()).await
}

async fn context_with(config: AuthConfig) -> TestContext {
    let store = Arc::new(AuthStore::in_memory().await.unwrap());
    let cache = Arc::new(MemoryCache::new(config.attempts_window_secs()));
    let vault = Arc::new(SecretVault::new(config.encryption_key()).unwrap());
    let codec = Arc::new(TokenCodec::new(&config));
    let notifier = Arc::new(RecordingNotifier::new());
    let flows = AuthFlows::new(
        store.clone(),
        cache,
        vault.clone(),
        codec.clone(),
        notifier.clone(),
        config,
    );
    TestContext {
        flows,
        store,
        vault,
        codec,
        notifier,
    }
}

async fn seed_user(ctx: &TestContext, password: &str) -> User {
    let user = User {
        id: Uuid::new_v4(),
        email: format!("{}@example.com", Uuid::new_v4().simple()),
        role: Role::User,
        provider: LOCAL_PROVIDER.to_string(),
        password_hash: Some(coffer_crypto::hash_password(password).unwrap()),
        created_at: Utc::now(),
    };
    ctx.store.create_user(&user).await.unwrap();
    user
}

/// Insert a verified device with a known TOTP secret.
async fn seed_active_device(ctx: &TestContext, user: &User, name: &str, is_default: bool) -> (Uuid, String) {
    let enrollment = totp::generate_enrollment("coffer", &user.email);
    let device = MfaDevice {
        id: Uuid::new_v4(),
        user_id: user.id,
        name: name.to_string(),
        kind: DeviceKind::Totp,
        encrypted_secret: ctx.vault.encrypt(&enrollment.secret).unwrap(),
        is_verified: true,
        is_default,
        created_at: Utc::now(),
        verified_at: Some(Utc::now()),
        last_used_at: None,
    };
    ctx.store.insert_device(&device).await.unwrap();
    (device.id, enrollment.secret)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn code_for(secret: &str) -> String {
    totp::code_at(secret, now_secs()).unwrap()
}

fn mfa_claims(user: &User, aud: Audience, challenge_id: Option<Uuid>) -> Claims {
    let now = Utc::now().timestamp();
    Claims {
        iss: "coffer".to_string(),
        aud: aud.as_str().to_string(),
        iat: now,
        exp: now + 300,
        user_id: user.id,
        email: user.email.clone(),
        role: user.role,
        provider: LOCAL_PROVIDER.to_string(),
        mfa: false,
        challenge_id,
    }
}

async fn seed_challenge(ctx: &TestContext, user: &User, code: &str, attempts: u32) -> Challenge {
    let challenge = Challenge::new(
        ChallengeKind::PasswordReset,
        user.id,
        coffer_crypto::hash_password(code).unwrap(),
        Utc::now() + Duration::minutes(15),
        attempts,
    );
    ctx.store.replace_challenge(&challenge).await.unwrap();
    challenge
}

// ----------------------------------------------------------------------
// Login
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_login_without_mfa_issues_session() {
    let ctx = context().await;
    let user = seed_user(&ctx, "correct-password").await;

    let grant = ctx.flows.login(&user.email, "correct-password").await.unwrap();
    let LoginGrant::Session(tokens) = grant else {
        panic!("expected a full session");
    };

    let access = ctx.codec.parse(&tokens.access_token, false).unwrap();
    assert_eq!(access.audience(), Some(Audience::App));
    assert_eq!(access.user_id, user.id);
    assert!(!access.mfa);

    let refresh = ctx.codec.parse(&tokens.refresh_token, false).unwrap();
    assert_eq!(refresh.audience(), Some(Audience::Refresh));
}

#[tokio::test]
async fn test_login_failures_are_indistinguishable() {
    let ctx = context().await;
    let user = seed_user(&ctx, "correct-password").await;

    let unknown = ctx.flows.login("nobody@example.com", "x").await.unwrap_err();
    let wrong = ctx.flows.login(&user.email, "wrong").await.unwrap_err();
    assert!(matches!(unknown, AuthError::InvalidCredentials));
    assert!(matches!(wrong, AuthError::InvalidCredentials));
}

#[tokio::test]
async fn test_login_with_enrolled_device_requires_mfa() {
    let ctx = context().await;
    let user = seed_user(&ctx, "correct-password").await;
    seed_active_device(&ctx, &user, "Phone", true).await;

    let grant = ctx.flows.login(&user.email, "correct-password").await.unwrap();
    let LoginGrant::MfaRequired { token } = grant else {
        panic!("expected an MFA hold, not a session");
    };

    let claims = ctx.codec.parse(&token, false).unwrap();
    assert_eq!(claims.audience(), Some(Audience::MfaLogin));
    assert!(!claims.mfa);
}

#[tokio::test]
async fn test_login_platform_mfa_required_without_devices() {
    let mut config = AuthConfig::for_tests();
    config.mfa_required = true;
    let ctx = context_with(config).await;
    let user = seed_user(&ctx, "pw").await;

    let grant = ctx.flows.login(&user.email, "pw").await.unwrap();
    assert!(matches!(grant, LoginGrant::MfaRequired { .. }));
}

#[tokio::test]
async fn test_login_domain_allow_list() {
    let mut config = AuthConfig::for_tests();
    config.allowed_email_domains = vec!["example.com".to_string()];
    let ctx = context_with(config).await;

    let user = seed_user(&ctx, "pw").await; // seeded at example.com
    assert!(ctx.flows.login(&user.email, "pw").await.is_ok());

    let outsider = User {
        id: Uuid::new_v4(),
        email: "eve@elsewhere.net".to_string(),
        role: Role::User,
        provider: LOCAL_PROVIDER.to_string(),
        password_hash: Some(coffer_crypto::hash_password("pw").unwrap()),
        created_at: Utc::now(),
    };
    ctx.store.create_user(&outsider).await.unwrap();
    assert!(matches!(
        ctx.flows.login(&outsider.email, "pw").await.unwrap_err(),
        AuthError::InvalidCredentials
    ));
}

#[tokio::test]
async fn test_login_local_provider_disabled() {
    let mut config = AuthConfig::for_tests();
    config.local_provider_enabled = false;
    let ctx = context_with(config).await;
    let user = seed_user(&ctx, "pw").await;

    assert!(matches!(
        ctx.flows.login(&user.email, "pw").await.unwrap_err(),
        AuthError::InvalidCredentials
    ));
}

// ----------------------------------------------------------------------
// MFA verification
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_verify_mfa_happy_path() {
    let ctx = context().await;
    let user = seed_user(&ctx, "pw").await;
    let (device_id, secret) = seed_active_device(&ctx, &user, "Phone", true).await;
    let claims = mfa_claims(&user, Audience::MfaLogin, None);

    let grant = ctx
        .flows
        .verify_mfa(&claims, None, &code_for(&secret))
        .await
        .unwrap();
    let VerifyGrant::Session(tokens) = grant else {
        panic!("expected session pair");
    };
    let access = ctx.codec.parse(&tokens.access_token, false).unwrap();
    assert!(access.mfa);

    let device = ctx.store.find_device(user.id, device_id).await.unwrap().unwrap();
    assert!(device.last_used_at.is_some());
}

#[tokio::test]
async fn test_verify_mfa_without_devices() {
    let ctx = context().await;
    let user = seed_user(&ctx, "pw").await;
    let claims = mfa_claims(&user, Audience::MfaLogin, None);

    assert!(matches!(
        ctx.flows.verify_mfa(&claims, None, "123456").await.unwrap_err(),
        AuthError::MfaNotEnabled
    ));
}

#[tokio::test]
async fn test_verify_mfa_selects_named_then_default_then_first() {
    let ctx = context().await;
    let user = seed_user(&ctx, "pw").await;
    let (first_id, _) = seed_active_device(&ctx, &user, "First", false).await;
    let (_, default_secret) = seed_active_device(&ctx, &user, "Default", true).await;
    let (named_id, named_secret) = seed_active_device(&ctx, &user, "Named", false).await;
    let claims = mfa_claims(&user, Audience::MfaLogin, None);

    // Named device wins when provided
    ctx.flows
        .verify_mfa(&claims, Some(named_id), &code_for(&named_secret))
        .await
        .unwrap();

    // Without a name, the default is consulted
    ctx.flows
        .verify_mfa(&claims, None, &code_for(&default_secret))
        .await
        .unwrap();

    // Unknown named device
    assert!(matches!(
        ctx.flows
            .verify_mfa(&claims, Some(Uuid::new_v4()), "123456")
            .await
            .unwrap_err(),
        AuthError::DeviceNotFound
    ));

    let _ = first_id;
}

#[tokio::test]
async fn test_verify_mfa_replay_rejected() {
    let ctx = context().await;
    let user = seed_user(&ctx, "pw").await;
    let (_, secret) = seed_active_device(&ctx, &user, "Phone", true).await;
    let claims = mfa_claims(&user, Audience::MfaLogin, None);
    let code = code_for(&secret);

    assert!(ctx.flows.verify_mfa(&claims, None, &code).await.is_ok());

    // Same code again within its validity window: poisoned
    assert!(matches!(
        ctx.flows.verify_mfa(&claims, None, &code).await.unwrap_err(),
        AuthError::InvalidCode
    ));
}

#[tokio::test]
async fn test_verify_mfa_rate_limit_and_reset() {
    let ctx = context().await;
    let user = seed_user(&ctx, "pw").await;
    let (_, secret) = seed_active_device(&ctx, &user, "Phone", true).await;
    let claims = mfa_claims(&user, Audience::MfaLogin, None);

    for _ in 0..5 {
        assert!(matches!(
            ctx.flows.verify_mfa(&claims, None, "000000").await.unwrap_err(),
            AuthError::InvalidCode
        ));
    }
    // Breached: refused before the secret is consulted
    assert!(matches!(
        ctx.flows
            .verify_mfa(&claims, None, &code_for(&secret))
            .await
            .unwrap_err(),
        AuthError::RateLimited
    ));
}

#[tokio::test]
async fn test_verify_mfa_success_resets_attempts() {
    let ctx = context().await;
    let user = seed_user(&ctx, "pw").await;
    let (_, secret) = seed_active_device(&ctx, &user, "Phone", true).await;
    let claims = mfa_claims(&user, Audience::MfaLogin, None);

    for _ in 0..4 {
        let _ = ctx.flows.verify_mfa(&claims, None, "000000").await;
    }
    ctx.flows
        .verify_mfa(&claims, None, &code_for(&secret))
        .await
        .unwrap();

    // Counter was reset; failures start from zero again
    assert!(matches!(
        ctx.flows.verify_mfa(&claims, None, "000000").await.unwrap_err(),
        AuthError::InvalidCode
    ));
}

#[tokio::test]
async fn test_verify_mfa_reset_scope_never_widens() {
    let ctx = context().await;
    let user = seed_user(&ctx, "pw").await;
    let (_, secret) = seed_active_device(&ctx, &user, "Phone", true).await;
    let challenge_id = Uuid::new_v4();
    let claims = mfa_claims(&user, Audience::MfaPasswordReset, Some(challenge_id));

    let grant = ctx
        .flows
        .verify_mfa(&claims, None, &code_for(&secret))
        .await
        .unwrap();
    let VerifyGrant::ResetScoped { access_token } = grant else {
        panic!("reset-scoped hold must re-issue a reset-scoped credential");
    };
    let parsed = ctx.codec.parse(&access_token, false).unwrap();
    assert_eq!(parsed.audience(), Some(Audience::MfaPasswordReset));
    assert!(parsed.mfa);
    assert_eq!(parsed.challenge_id, Some(challenge_id));
}

// ----------------------------------------------------------------------
// Password reset
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_reset_request_unknown_email_no_side_effect() {
    let ctx = context().await;
    ctx.flows
        .request_password_reset("ghost@example.com")
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    assert_eq!(ctx.notifier.count().await, 0);
}

#[tokio::test]
async fn test_reset_full_flow() {
    let ctx = context().await;
    let user = seed_user(&ctx, "old-password").await;

    ctx.flows.request_password_reset(&user.email).await.unwrap();

    let Some(Notification::PasswordResetCode { code, .. }) = ctx.notifier.wait_for_event().await
    else {
        panic!("reset code was not published");
    };

    // The challenge id normally travels out-of-band in the reset link;
    // recover it from the store directly.
    let challenge = find_challenge_id(&ctx, user.id).await;

    let validation = ctx
        .flows
        .validate_reset_code(challenge, &code)
        .await
        .unwrap();
    assert!(!validation.mfa_required);

    let claims = ctx.codec.parse(&validation.token, false).unwrap();
    assert_eq!(claims.audience(), Some(Audience::MfaPasswordReset));
    assert!(!claims.mfa);
    assert_eq!(claims.challenge_id, Some(challenge));

    let tokens = ctx
        .flows
        .complete_password_reset(&claims, challenge, "new-password")
        .await
        .unwrap();
    assert!(!tokens.access_token.is_empty());

    // Old password dead, new password live
    assert!(ctx.flows.login(&user.email, "old-password").await.is_err());
    assert!(ctx.flows.login(&user.email, "new-password").await.is_ok());

    // Challenge consumed
    assert!(matches!(
        ctx.flows
            .complete_password_reset(&claims, challenge, "again")
            .await
            .unwrap_err(),
        AuthError::ChallengeInvalid
    ));
}

/// Find the single password-reset challenge id for a user.
async fn find_challenge_id(ctx: &TestContext, user_id: Uuid) -> Uuid {
    let mut tx = ctx.store.begin().await.unwrap();
    let id: String = sqlx::query_scalar(
        "SELECT id FROM challenges WHERE user_id = ? AND kind = 'password_reset'",
    )
    .bind(user_id.to_string())
    .fetch_one(&mut *tx)
    .await
    .unwrap();
    tx.commit().await.unwrap();
    Uuid::parse_str(&id).unwrap()
}

#[tokio::test]
async fn test_reset_code_lockout_sequence() {
    let ctx = context().await;
    let user = seed_user(&ctx, "pw").await;
    let challenge = seed_challenge(&ctx, &user, "AB12CD", 5).await;

    for _ in 0..4 {
        assert!(matches!(
            ctx.flows
                .validate_reset_code(challenge.id, "XXXXXX")
                .await
                .unwrap_err(),
            AuthError::WrongCode
        ));
    }
    // Fifth wrong submission locks and deletes
    assert!(matches!(
        ctx.flows
            .validate_reset_code(challenge.id, "XXXXXX")
            .await
            .unwrap_err(),
        AuthError::ChallengeLocked
    ));
    // Even the correct code is now invalid: the challenge no longer exists
    assert!(matches!(
        ctx.flows
            .validate_reset_code(challenge.id, "AB12CD")
            .await
            .unwrap_err(),
        AuthError::ChallengeInvalid
    ));
}

#[tokio::test]
async fn test_reset_code_is_case_insensitive_on_input() {
    let ctx = context().await;
    let user = seed_user(&ctx, "pw").await;
    let challenge = seed_challenge(&ctx, &user, "AB12CD", 5).await;

    // Submitted lowercase; normalized to uppercase before comparison
    assert!(ctx
        .flows
        .validate_reset_code(challenge.id, "ab12cd")
        .await
        .is_ok());
}

#[tokio::test]
async fn test_reset_expired_challenge_deleted_on_load() {
    let ctx = context().await;
    let user = seed_user(&ctx, "pw").await;
    let mut challenge = Challenge::new(
        ChallengeKind::PasswordReset,
        user.id,
        coffer_crypto::hash_password("AB12CD").unwrap(),
        Utc::now() - Duration::minutes(1),
        5,
    );
    challenge.attempts_left = 5;
    ctx.store.replace_challenge(&challenge).await.unwrap();

    assert!(matches!(
        ctx.flows
            .validate_reset_code(challenge.id, "AB12CD")
            .await
            .unwrap_err(),
        AuthError::ChallengeExpired
    ));
    // Deleted in the same transaction
    assert!(ctx
        .store
        .get_challenge(ChallengeKind::PasswordReset, challenge.id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_reset_validation_reports_mfa_requirement() {
    let ctx = context().await;
    let user = seed_user(&ctx, "pw").await;
    seed_active_device(&ctx, &user, "Phone", true).await;
    let challenge = seed_challenge(&ctx, &user, "AB12CD", 5).await;

    let ResetValidation { mfa_required, .. } = ctx
        .flows
        .validate_reset_code(challenge.id, "AB12CD")
        .await
        .unwrap();
    assert!(mfa_required);
}

#[tokio::test]
async fn test_reset_completion_mfa_bypass_guard() {
    let ctx = context().await;
    let user = seed_user(&ctx, "old-password").await;
    seed_active_device(&ctx, &user, "Phone", true).await;
    let challenge = seed_challenge(&ctx, &user, "AB12CD", 5).await;

    let validation = ctx
        .flows
        .validate_reset_code(challenge.id, "AB12CD")
        .await
        .unwrap();
    let claims = ctx.codec.parse(&validation.token, false).unwrap();
    assert!(!claims.mfa);

    // mfa = false + enrolled user: refused, password untouched
    assert!(matches!(
        ctx.flows
            .complete_password_reset(&claims, challenge.id, "new-password")
            .await
            .unwrap_err(),
        AuthError::MfaRequired
    ));
    assert!(ctx.flows.login(&user.email, "old-password").await.is_ok());
}

#[tokio::test]
async fn test_reset_completion_challenge_binding() {
    let ctx = context().await;
    let user = seed_user(&ctx, "pw").await;
    let challenge = seed_challenge(&ctx, &user, "AB12CD", 5).await;

    let validation = ctx
        .flows
        .validate_reset_code(challenge.id, "AB12CD")
        .await
        .unwrap();
    let claims = ctx.codec.parse(&validation.token, false).unwrap();

    // URL names a different challenge than the credential binds
    assert!(matches!(
        ctx.flows
            .complete_password_reset(&claims, Uuid::new_v4(), "new-password")
            .await
            .unwrap_err(),
        AuthError::ChallengeInvalid
    ));
}

// ----------------------------------------------------------------------
// Refresh / inspect
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_refresh_issues_fresh_access_token() {
    let ctx = context().await;
    let user = seed_user(&ctx, "pw").await;

    let LoginGrant::Session(tokens) = ctx.flows.login(&user.email, "pw").await.unwrap() else {
        panic!("expected session");
    };

    let access = ctx.flows.refresh(&tokens.refresh_token).await.unwrap();
    let claims = ctx.codec.parse(&access, false).unwrap();
    assert_eq!(claims.audience(), Some(Audience::App));
    assert_eq!(claims.user_id, user.id);
    assert_eq!(claims.provider, LOCAL_PROVIDER);
}

#[tokio::test]
async fn test_refresh_rejects_non_refresh_audience() {
    let ctx = context().await;
    let user = seed_user(&ctx, "pw").await;

    let LoginGrant::Session(tokens) = ctx.flows.login(&user.email, "pw").await.unwrap() else {
        panic!("expected session");
    };

    assert!(matches!(
        ctx.flows.refresh(&tokens.access_token).await.unwrap_err(),
        AuthError::InvalidCredential
    ));
}

#[tokio::test]
async fn test_inspect_token() {
    let ctx = context().await;
    let user = seed_user(&ctx, "pw").await;

    let LoginGrant::Session(tokens) = ctx.flows.login(&user.email, "pw").await.unwrap() else {
        panic!("expected session");
    };

    let claims = ctx.flows.inspect_token(&tokens.access_token).unwrap();
    assert_eq!(claims.user_id, user.id);

    assert!(matches!(
        ctx.flows.inspect_token("garbage").unwrap_err(),
        AuthError::InvalidCredentials
    ));
}
