//! Server assembly: configuration, state construction, and the listener.

pub mod config;
pub mod init;

pub use config::AppConfig;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tracing::info;

/// Build state from config, assemble the router, and serve until shutdown.
pub async fn run(config: AppConfig) -> Result<()> {
    let state = init::build_state(&config).await?;
    let app = init::build_router(&state, &config);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid listen address {}:{}",
                config.server.host, config.server.port
            )
        })?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(%addr, "coffer auth service listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
