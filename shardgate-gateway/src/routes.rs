use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

use crate::handlers::{self, AppState};

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/files/upload", post(handlers::upload_file))
        .route("/api/files/get", get(handlers::get_file))
        .route("/api/files/chunks", get(handlers::list_chunks))
        .route("/health", get(handlers::health))
        // Uploads are streamed into chunk pipes, never buffered whole.
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}
