//! Driftwood server binary.

use std::time::Duration;

use driftwood::config::AppConfig;
use driftwood::{AppState, build_router, metrics};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    match config.logging.format.as_str() {
        "json" => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).pretty().init(),
    }

    metrics::init_metrics();

    let state = AppState::new(config.clone()).await?;
    spawn_maintenance_tasks(state.clone());

    let router = build_router(state);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    tracing::info!(
        addr = %bind_addr,
        base_url = %config.server.base_url(),
        "Driftwood listening"
    );
    axum::serve(listener, router).await?;

    Ok(())
}

/// Periodic cache and lock eviction plus instance key rotation.
fn spawn_maintenance_tasks(state: std::sync::Arc<AppState>) {
    let cache_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            cache_state.key_cache.evict_expired().await;
            cache_state.collections.evict_idle_locks().await;
        }
    });

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            interval.tick().await;
            if state.keys.is_expired().await {
                if let Err(e) = state.keys.rotate().await {
                    tracing::error!(error = %e, "Scheduled key rotation failed");
                }
            }
        }
    });
}
