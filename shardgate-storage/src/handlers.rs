use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::TryStreamExt;
use serde::Deserialize;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{error, info, warn};

use shardgate_common::backend::{BackendError, ChunkBackend, ChunkKey};
use shardgate_common::records::FileId;

use crate::store::DirectoryStore;

#[derive(Deserialize)]
pub struct ChunkQuery {
    pub file_uuid: String,
    pub chunk_index: u32,
}

impl ChunkQuery {
    fn key(&self) -> Result<ChunkKey, Response> {
        FileId::parse(&self.file_uuid)
            .map(|id| ChunkKey::new(id, self.chunk_index))
            .map_err(|e| {
                (StatusCode::BAD_REQUEST, Json(error_json("bad_request", &e.to_string()))).into_response()
            })
    }
}

/// POST /api/chunks/upload?file_uuid=&chunk_index=: store the raw request body
pub async fn upload_chunk(
    State(store): State<Arc<DirectoryStore>>,
    Query(query): Query<ChunkQuery>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let key = match query.key() {
        Ok(k) => k,
        Err(resp) => return resp,
    };

    let Some(length) = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    else {
        return (
            StatusCode::LENGTH_REQUIRED,
            Json(error_json("length_required", "Content-Length header is required")),
        )
            .into_response();
    };

    let stream = body.into_data_stream().map_err(io::Error::other);
    let reader = StreamReader::new(stream);

    match store.upload(&key, length, Box::pin(reader)).await {
        Ok(()) => {
            info!(key = %key, bytes = length, "Chunk upload complete");
            Json(serde_json::json!({
                "file_uuid": key.file_id,
                "chunk_index": key.chunk_index,
                "size": length,
            }))
            .into_response()
        }
        Err(BackendError::LengthMismatch { expected, actual }) => {
            warn!(key = %key, expected, actual, "Chunk upload body ended early");
            (
                StatusCode::BAD_REQUEST,
                Json(error_json(
                    "length_mismatch",
                    &format!("expected {} bytes, received {}", expected, actual),
                )),
            )
                .into_response()
        }
        Err(e) => {
            error!(key = %key, error = %e, "Chunk upload failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(error_json("internal", &e.to_string()))).into_response()
        }
    }
}

/// GET /api/chunks/download?file_uuid=&chunk_index=: stream a stored chunk back
pub async fn download_chunk(
    State(store): State<Arc<DirectoryStore>>,
    Query(query): Query<ChunkQuery>,
) -> Response {
    let key = match query.key() {
        Ok(k) => k,
        Err(resp) => return resp,
    };

    match store.open_chunk(&key).await {
        Ok((reader, len)) => (
            [
                (CONTENT_TYPE, "application/octet-stream".to_string()),
                (CONTENT_LENGTH, len.to_string()),
            ],
            Body::from_stream(ReaderStream::new(reader)),
        )
            .into_response(),
        Err(BackendError::NotFound(name)) => (
            StatusCode::NOT_FOUND,
            Json(error_json("not_found", &format!("chunk {} not found", name))),
        )
            .into_response(),
        Err(e) => {
            error!(key = %key, error = %e, "Chunk download failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(error_json("internal", &e.to_string()))).into_response()
        }
    }
}

/// GET /health
pub async fn health(State(store): State<Arc<DirectoryStore>>) -> Response {
    match store.health_check().await {
        Ok(()) => Json(serde_json::json!({ "status": "ok" })).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(error_json("unavailable", &e.to_string())),
        )
            .into_response(),
    }
}

pub fn error_json(code: &str, message: &str) -> serde_json::Value {
    serde_json::json!({ "error": { "code": code, "message": message } })
}
