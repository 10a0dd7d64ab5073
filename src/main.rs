//! Coffer - secure file sharing
//!
//! Entry point for the authentication service.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod middleware;
mod server;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let (non_blocking, _guard) = tracing_appender::non_blocking(std::io::stderr());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coffer=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
        .init();

    info!("Starting Coffer auth service v{}", env!("CARGO_PKG_VERSION"));

    let config_path =
        std::env::var("COFFER_CONFIG").unwrap_or_else(|_| "coffer.toml".to_string());
    let config = server::AppConfig::load(std::path::Path::new(&config_path))
        .with_context(|| format!("failed to load configuration from {}", config_path))?;

    server::run(config).await
}
