use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use shardgate_common::records::FileId;

use crate::chunker::ChunkerService;
use crate::error::{ChunkerError, IntegrityError};

/// Buffer between the retrieval task and the response body.
const RESPONSE_PIPE_CAPACITY: usize = 64 * 1024;

pub struct AppState {
    pub chunker: ChunkerService,
}

#[derive(Deserialize)]
pub struct UploadQuery {
    pub chunks: Option<u32>,
}

#[derive(Deserialize)]
pub struct FileQuery {
    pub file_uuid: String,
}

/// POST /api/files/upload[?chunks=N]: ingest the raw request body
pub async fn upload_file(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Response {
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

    let reader = StreamReader::new(body.into_data_stream().map_err(io::Error::other));
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    match state.chunker.ingest(reader, length, query.chunks, &cancel).await {
        Ok(file_id) => Json(serde_json::json!({ "file_uuid": file_id })).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /api/files/get?file_uuid=: stream a stored file back
///
/// The record set is verified before the response starts. A failure after that point
/// aborts the body, so a client never sees a truncated file as a complete one.
pub async fn get_file(State(state): State<Arc<AppState>>, Query(query): Query<FileQuery>) -> Response {
    let file_id = match FileId::parse(&query.file_uuid) {
        Ok(id) => id,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(error_json("bad_request", &e.to_string()))).into_response();
        }
    };

    let cancel = CancellationToken::new();
    let plan = match state.chunker.open(&file_id, &cancel).await {
        Ok(plan) => plan,
        Err(e) => return error_response(&e),
    };
    let total_size = plan.total_size();

    let (mut writer, reader) = tokio::io::duplex(RESPONSE_PIPE_CAPACITY);
    let (done_tx, done_rx) = oneshot::channel::<Result<u64, ChunkerError>>();
    let chunker = state.chunker.clone();
    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        let result = chunker.stream(&plan, &mut writer, &task_cancel).await;
        match &result {
            Ok(_) => {
                let _ = writer.shutdown().await;
            }
            Err(e) => warn!(file_id = %plan.file_id, error = %e, "Retrieval aborted"),
        }
        let _ = done_tx.send(result);
    });

    // Dropping the body (client gone) drops the guard and stops the retrieval task.
    let guard = cancel.drop_guard();
    let tail = futures::stream::once(async move {
        let _guard = guard;
        match done_rx.await {
            Ok(Ok(_)) => None::<io::Result<Bytes>>,
            Ok(Err(e)) => Some(Err(io::Error::other(e.to_string()))),
            Err(_) => Some(Err(io::Error::other("retrieval task ended without a result"))),
        }
    })
    .filter_map(|item| async move { item });

    let body = Body::from_stream(ReaderStream::new(reader).chain(tail));

    info!(file_id = %file_id, bytes = total_size, "Streaming file");
    (
        [
            (CONTENT_TYPE, "application/octet-stream".to_string()),
            (CONTENT_LENGTH, total_size.to_string()),
        ],
        body,
    )
        .into_response()
}

/// GET /api/files/chunks?file_uuid=: chunk records of a file
pub async fn list_chunks(State(state): State<Arc<AppState>>, Query(query): Query<FileQuery>) -> Response {
    let file_id = match FileId::parse(&query.file_uuid) {
        Ok(id) => id,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(error_json("bad_request", &e.to_string()))).into_response();
        }
    };

    match state.chunker.list_chunks(&file_id).await {
        Ok(records) if records.is_empty() => (
            StatusCode::NOT_FOUND,
            Json(error_json("not_found", &format!("no chunks recorded for file {}", file_id))),
        )
            .into_response(),
        Ok(records) => Json(serde_json::json!({
            "file_uuid": file_id,
            "chunks": records,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /health: probe one randomly picked backend
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let (index, endpoint, result) = state.chunker.probe_random_backend().await;
    match result {
        Ok(()) => Json(serde_json::json!({
            "status": "ok",
            "backend": index,
            "endpoint": endpoint,
        }))
        .into_response(),
        Err(e) => {
            warn!(backend = index, endpoint = %endpoint, error = %e, "Health probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(error_json("backend_unavailable", &format!("backend {} ({}): {}", index, endpoint, e))),
            )
                .into_response()
        }
    }
}

fn error_response(err: &ChunkerError) -> Response {
    let (status, code) = match err {
        ChunkerError::Validation(_) | ChunkerError::Source(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        ChunkerError::Integrity(IntegrityError::UnknownFile(_)) => (StatusCode::NOT_FOUND, "not_found"),
        ChunkerError::Integrity(_) => (StatusCode::CONFLICT, "integrity"),
        ChunkerError::Transfer { .. } => (StatusCode::BAD_GATEWAY, "backend_unavailable"),
        ChunkerError::Persistence(_) => (StatusCode::SERVICE_UNAVAILABLE, "metadata_unavailable"),
        ChunkerError::Sink(_) | ChunkerError::Task(_) | ChunkerError::Cancelled => {
            (StatusCode::INTERNAL_SERVER_ERROR, "internal")
        }
    };
    if status.is_server_error() {
        error!(error = %err, "Request failed");
    }
    (status, Json(error_json(code, &err.to_string()))).into_response()
}

pub fn error_json(code: &str, message: &str) -> serde_json::Value {
    serde_json::json!({ "error": { "code": code, "message": message } })
}
