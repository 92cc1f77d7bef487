//! Storage node backend.
//!
//! Talks to a `shardgate-storage` node over plain HTTP. Upload bodies are streamed from the
//! chunk pipe with an explicit `Content-Length`; download bodies are handed back as a
//! stream without buffering.

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::StatusCode;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::debug;

use shardgate_common::backend::{BackendError, ChunkBackend, ChunkKey, ChunkReader};

pub struct HttpNodeBackend {
    base_url: String,
    client: reqwest::Client,
}

impl HttpNodeBackend {
    pub fn new(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn chunk_url(&self, action: &str, key: &ChunkKey) -> String {
        format!(
            "{}/api/chunks/{}?file_uuid={}&chunk_index={}",
            self.base_url,
            action,
            urlencoding::encode(key.file_id.as_str()),
            key.chunk_index
        )
    }
}

async fn rejected(resp: reqwest::Response) -> BackendError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    BackendError::Rejected { status, body }
}

#[async_trait]
impl ChunkBackend for HttpNodeBackend {
    async fn upload(&self, key: &ChunkKey, length: u64, body: ChunkReader) -> Result<(), BackendError> {
        let resp = self
            .client
            .post(self.chunk_url("upload", key))
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, length)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(body)))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(rejected(resp).await);
        }

        debug!(key = %key, node = %self.base_url, "Node upload complete");
        Ok(())
    }

    async fn download(&self, key: &ChunkKey) -> Result<ChunkReader, BackendError> {
        let resp = self.client.get(self.chunk_url("download", key)).send().await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(key.object_name()));
        }
        if !resp.status().is_success() {
            return Err(rejected(resp).await);
        }

        let stream = resp.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::pin(StreamReader::new(stream)))
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        let resp = self.client.get(format!("{}/health", self.base_url)).send().await?;
        if !resp.status().is_success() {
            return Err(rejected(resp).await);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.base_url.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardgate_common::records::FileId;

    #[test]
    fn test_chunk_url() {
        let backend = HttpNodeBackend::new("http://storage-0:8081/", reqwest::Client::new());
        let key = ChunkKey::new(FileId::parse("9b2f6f4e-3c1a-4d2b-8e7f-0a1b2c3d4e5f").unwrap(), 4);
        assert_eq!(
            backend.chunk_url("upload", &key),
            "http://storage-0:8081/api/chunks/upload?file_uuid=9b2f6f4e-3c1a-4d2b-8e7f-0a1b2c3d4e5f&chunk_index=4"
        );
        assert_eq!(backend.describe(), "http://storage-0:8081");
    }
}
