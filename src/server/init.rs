//! State construction and router assembly.
//!
//! Builds the vault, token codec, store, verification cache, and the two
//! service objects, then stacks the middleware pipeline in its fixed order:
//! authenticate (outermost) → audience scope → MFA enforcement → rate limit.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Extension, Router};
use coffer_auth::{
    AuthConfig, AuthFlows, AuthStore, DeviceRegistry, LogNotifier, MemoryCache, RedisCache,
    TokenCodec, VerificationCache,
};
use coffer_crypto::SecretVault;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::api;
use crate::middleware::auth::AuthenticateLayer;
use crate::middleware::mfa::MfaEnforcementLayer;
use crate::middleware::rate_limit::RateLimitLayer;
use crate::middleware::scope::ScopeLayer;
use crate::server::AppConfig;

/// Shared application state.
pub struct AppState {
    pub store: Arc<AuthStore>,
    pub codec: Arc<TokenCodec>,
    pub flows: Arc<AuthFlows>,
    pub registry: Arc<DeviceRegistry>,
}

/// Build state from configuration. Config validation failures and an
/// unreachable database are fatal here, before the listener binds.
pub async fn build_state(config: &AppConfig) -> Result<AppState> {
    config
        .auth
        .validate()
        .context("invalid auth configuration")?;

    let store = Arc::new(
        AuthStore::from_path(&config.database.path)
            .await
            .with_context(|| format!("failed to open {}", config.database.path.display()))?,
    );

    let cache: Arc<dyn VerificationCache> = match &config.redis.url {
        Some(url) => {
            info!("using redis verification cache");
            Arc::new(
                RedisCache::new(url, config.auth.attempts_window_secs())
                    .context("failed to configure redis")?,
            )
        }
        None => {
            warn!("redis not configured; falling back to in-process verification cache");
            Arc::new(MemoryCache::new(config.auth.attempts_window_secs()))
        }
    };

    Ok(assemble_state(store, cache, config.auth.clone())?)
}

/// Wire the service objects from their collaborators.
fn assemble_state(
    store: Arc<AuthStore>,
    cache: Arc<dyn VerificationCache>,
    auth: AuthConfig,
) -> Result<AppState> {
    let vault = Arc::new(
        SecretVault::new(auth.encryption_key()).context("invalid MFA encryption key")?,
    );
    let codec = Arc::new(TokenCodec::new(&auth));
    let notifier = Arc::new(LogNotifier);

    let flows = Arc::new(AuthFlows::new(
        store.clone(),
        cache.clone(),
        vault.clone(),
        codec.clone(),
        notifier.clone(),
        auth.clone(),
    ));
    let registry = Arc::new(DeviceRegistry::new(
        store.clone(),
        cache,
        vault,
        codec.clone(),
        notifier,
        auth,
    ));

    Ok(AppState {
        store,
        codec,
        flows,
        registry,
    })
}

/// Assemble the router with the middleware pipeline.
///
/// Layers added later wrap the ones before, so the pipeline order reads
/// bottom-up here: authenticate runs first on the wire, rate limit last.
pub fn build_router(state: &AppState, config: &AppConfig) -> Router {
    Router::new()
        .merge(api::api_router())
        .layer(RateLimitLayer::new(
            &config.rate_limit,
            config.server.trusted_proxies.clone(),
        ))
        .layer(MfaEnforcementLayer::new(
            state.store.clone(),
            config.auth.mfa_required,
        ))
        .layer(ScopeLayer)
        .layer(AuthenticateLayer::new(state.codec.clone()))
        .layer(Extension(state.flows.clone()))
        .layer(Extension(state.registry.clone()))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
