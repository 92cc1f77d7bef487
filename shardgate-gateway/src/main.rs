use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use shardgate_gateway::backend::{self, BackendSet};
use shardgate_gateway::chunker::ChunkerService;
use shardgate_gateway::config::{BackendConfig, GatewayConfig};
use shardgate_gateway::handlers::AppState;
use shardgate_gateway::metadata::SqliteMetadataStore;
use shardgate_gateway::routes;

const STARTUP_PROBE_DELAY: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    info!("shardgate-gateway starting");

    let config = match std::env::args_os().nth(1) {
        Some(path) => GatewayConfig::load(&PathBuf::from(path))?,
        None => GatewayConfig::from_env()?,
    };

    if let Some(parent) = config.metadata_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let metadata = SqliteMetadataStore::open(&config.metadata_path)
        .with_context(|| format!("Failed to open {}", config.metadata_path.display()))?;
    info!(path = %config.metadata_path.display(), "Metadata store ready");

    for entry in &config.backends {
        if let BackendConfig::Directory { path } = entry {
            std::fs::create_dir_all(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
        }
    }

    let client = config.http_client()?;
    let backends = BackendSet::new(
        config
            .backends
            .iter()
            .map(|entry| backend::from_config(entry, &client))
            .collect(),
    )?;
    backends
        .wait_until_reachable(config.startup_probe_attempts, STARTUP_PROBE_DELAY)
        .await?;
    info!(count = backends.len().get(), "All storage backends reachable");

    let chunker = ChunkerService::new(backends, Arc::new(metadata), config.chunker_settings());
    let state = Arc::new(AppState { chunker });
    let app = routes::build_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening on http://{}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shardgate-gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
