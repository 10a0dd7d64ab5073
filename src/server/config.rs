//! Server configuration types
//!
//! The application TOML has four sections: `[server]`, `[database]`,
//! `[redis]`, `[rate_limit]`, plus the auth core's `[auth]` contract. The
//! two secrets can also arrive through the environment
//! (`COFFER_JWT_SECRET`, `COFFER_MFA_ENCRYPTION_KEY`), which takes
//! precedence over the file.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use coffer_auth::AuthConfig;
use serde::{Deserialize, Serialize};

use crate::middleware::rate_limit::RateLimitSettings;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    pub auth: AuthConfig,
}

impl AppConfig {
    /// Load from a TOML file, then apply environment overrides for secrets.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read {}", path.as_ref().display()))?;
        let mut config: AppConfig =
            toml::from_str(&content).context("failed to parse config file")?;

        if let Ok(secret) = std::env::var("COFFER_JWT_SECRET") {
            config.auth.jwt_secret = secret;
        }
        if let Ok(key) = std::env::var("COFFER_MFA_ENCRYPTION_KEY") {
            config.auth.mfa_encryption_key = key;
        }

        Ok(config)
    }
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Proxies whose `X-Forwarded-For` is believed for client-IP extraction
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            trusted_proxies: Vec::new(),
        }
    }
}

/// SQLite database location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/coffer.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Redis connection for the verification cache. Absent in development, in
/// which case an in-process cache is used and logged loudly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [auth]
            jwt_secret = "file-secret-file-secret-file-secret"
            mfa_encryption_key = "0123456789abcdef0123456789abcdef"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert!(config.server.trusted_proxies.is_empty());
        assert_eq!(config.database.path, PathBuf::from("data/coffer.db"));
        assert!(config.redis.url.is_none());
        assert!(config.rate_limit.enabled);
        assert!(config.auth.validate().is_ok());
    }

    #[test]
    fn test_full_config_parses() {
        let config: AppConfig = toml::from_str(
            r#"
            [server]
            host = "0.0.0.0"
            port = 9000
            trusted_proxies = ["10.0.0.1"]

            [database]
            path = "/var/lib/coffer/auth.db"

            [redis]
            url = "redis://localhost:6379"

            [rate_limit]
            enabled = false
            burst = 10
            per_second = 0.5

            [auth]
            jwt_secret = "file-secret-file-secret-file-secret"
            mfa_encryption_key = "0123456789abcdef0123456789abcdef"
            mfa_required = true
            access_token_expiry_minutes = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.trusted_proxies.len(), 1);
        assert_eq!(config.redis.url.as_deref(), Some("redis://localhost:6379"));
        assert!(!config.rate_limit.enabled);
        assert!(config.auth.mfa_required);
        assert_eq!(config.auth.access_token_expiry_minutes, 30);
    }
}
