use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use shardgate_storage::build_router;
use shardgate_storage::store::DirectoryStore;

const DEFAULT_PORT: u16 = 8081;
const DEFAULT_DATA_DIR: &str = "/var/lib/shardgate/chunks";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    info!("shardgate-storage starting");

    let data_dir =
        std::env::var("SHARDGATE_STORAGE_DIR").unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string());
    let port: u16 = std::env::var("SHARDGATE_STORAGE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let store = Arc::new(DirectoryStore::new(&data_dir));
    store.ensure().await?;
    info!(data_dir = %data_dir, "Chunk directory ready");

    let app = build_router(store).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(port = port, "Listening on http://0.0.0.0:{}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shardgate-storage stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
