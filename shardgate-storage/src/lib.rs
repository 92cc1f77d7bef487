//! Storage node: a plain HTTP object store for chunk bytes.

pub mod handlers;
pub mod store;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

use store::DirectoryStore;

pub fn build_router(store: Arc<DirectoryStore>) -> Router {
    Router::new()
        .route("/api/chunks/upload", post(handlers::upload_chunk))
        .route("/api/chunks/download", get(handlers::download_chunk))
        .route("/health", get(handlers::health))
        // Chunk bodies are streamed to disk, never buffered.
        .layer(DefaultBodyLimit::disable())
        .with_state(store)
}
