//! Single-chunk transfers with one-pass hashing.
//!
//! Bytes are hashed as they pass between the chunk pipe and the backend, so no chunk is
//! ever read twice or buffered whole just to compute its digest.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{ready, Context, Poll};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;

use shardgate_common::backend::{ChunkBackend, ChunkKey, ChunkReader};

use crate::error::TransferError;

/// Digest and length of the bytes that passed through a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDigest {
    pub hex: String,
    pub bytes: u64,
}

#[derive(Default)]
struct TapState {
    hasher: Sha256,
    bytes: u64,
}

/// Shared running digest. A clone stays with the caller while the stream it observes is
/// handed off to a backend.
#[derive(Clone, Default)]
pub struct DigestTap {
    state: Arc<Mutex<TapState>>,
}

impl DigestTap {
    fn lock(&self) -> MutexGuard<'_, TapState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn observe(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut state = self.lock();
        state.hasher.update(data);
        state.bytes += data.len() as u64;
    }

    pub fn finish(&self) -> ChunkDigest {
        let state = self.lock();
        ChunkDigest {
            hex: hex::encode(state.hasher.clone().finalize()),
            bytes: state.bytes,
        }
    }
}

/// Reader adapter feeding every byte read into a [`DigestTap`].
pub struct HashingReader<R> {
    inner: R,
    tap: DigestTap,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R, tap: DigestTap) -> Self {
        Self { inner, tap }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        self.tap.observe(&buf.filled()[before..]);
        Poll::Ready(Ok(()))
    }
}

/// Writer adapter hashing every byte the inner writer accepts.
pub struct HashingWriter<W> {
    inner: W,
    tap: DigestTap,
}

impl<W> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, tap: DigestTap::default() }
    }

    pub fn digest(&self) -> ChunkDigest {
        self.tap.finish()
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for HashingWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let n = ready!(Pin::new(&mut self.inner).poll_write(cx, buf))?;
        self.tap.observe(&buf[..n]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Stream exactly `length` bytes from `body` to `backend`, hashing them on the way.
///
/// The digest is only returned once the backend has confirmed the write. Cancellation
/// drops the in-flight backend request.
pub async fn upload_chunk(
    backend: &dyn ChunkBackend,
    key: &ChunkKey,
    length: u64,
    body: ChunkReader,
    cancel: &CancellationToken,
) -> Result<ChunkDigest, TransferError> {
    let tap = DigestTap::default();
    let reader = HashingReader::new(body, tap.clone());

    tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        result = backend.upload(key, length, Box::pin(reader)) => result?,
    }

    let digest = tap.finish();
    if digest.bytes != length {
        return Err(TransferError::ShortBody { expected: length, actual: digest.bytes });
    }
    Ok(digest)
}

/// Stream one chunk from `backend` into `sink`, hashing it on the way.
///
/// The caller compares the returned digest with the stored record.
pub async fn download_chunk<W>(
    backend: &dyn ChunkBackend,
    key: &ChunkKey,
    sink: &mut W,
    cancel: &CancellationToken,
) -> Result<ChunkDigest, TransferError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let transfer = async {
        let mut reader = backend.download(key).await?;
        let mut writer = HashingWriter::new(&mut *sink);
        tokio::io::copy(&mut reader, &mut writer).await?;
        writer.flush().await?;
        Ok::<_, TransferError>(writer.digest())
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        result = transfer => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use shardgate_common::backend::BackendError;
    use shardgate_common::records::FileId;

    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    fn key(index: u32) -> ChunkKey {
        ChunkKey::new(FileId::parse("9b2f6f4e-3c1a-4d2b-8e7f-0a1b2c3d4e5f").unwrap(), index)
    }

    #[tokio::test]
    async fn test_upload_hashes_in_flight() {
        let backend = MemoryBackend::new();
        let token = CancellationToken::new();

        let digest = upload_chunk(&backend, &key(0), 3, Box::pin(io::Cursor::new(b"abc".to_vec())), &token)
            .await
            .unwrap();
        assert_eq!(digest.hex, ABC_SHA256);
        assert_eq!(digest.bytes, 3);
        assert_eq!(backend.object(&key(0)).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_download_hash_matches_upload() {
        let backend = MemoryBackend::new();
        let token = CancellationToken::new();
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();

        let up = upload_chunk(
            &backend,
            &key(1),
            payload.len() as u64,
            Box::pin(io::Cursor::new(payload.clone())),
            &token,
        )
        .await
        .unwrap();

        let mut sink = Vec::new();
        let down = download_chunk(&backend, &key(1), &mut sink, &token).await.unwrap();
        assert_eq!(up, down);
        assert_eq!(sink, payload);
    }

    #[tokio::test]
    async fn test_empty_chunk_digest() {
        let backend = MemoryBackend::new();
        let token = CancellationToken::new();
        let digest = upload_chunk(&backend, &key(2), 0, Box::pin(tokio::io::empty()), &token).await.unwrap();
        assert_eq!(digest.bytes, 0);
        assert_eq!(digest.hex, hex::encode(Sha256::digest(b"")));
    }

    #[tokio::test]
    async fn test_short_body_fails() {
        let backend = MemoryBackend::new();
        let token = CancellationToken::new();
        let result =
            upload_chunk(&backend, &key(0), 10, Box::pin(io::Cursor::new(b"abc".to_vec())), &token).await;
        assert!(matches!(
            result,
            Err(TransferError::Backend(BackendError::LengthMismatch { expected: 10, actual: 3 }))
        ));
        assert!(backend.object(&key(0)).is_none());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let backend = MemoryBackend::new();
        let token = CancellationToken::new();
        token.cancel();

        let result =
            upload_chunk(&backend, &key(0), 3, Box::pin(io::Cursor::new(b"abc".to_vec())), &token).await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert_eq!(backend.object_count(), 0);

        let mut sink = Vec::new();
        let result = download_chunk(&backend, &key(0), &mut sink, &token).await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
    }

    #[tokio::test]
    async fn test_download_missing() {
        let backend = MemoryBackend::new();
        let mut sink = Vec::new();
        let result = download_chunk(&backend, &key(9), &mut sink, &CancellationToken::new()).await;
        assert!(matches!(result, Err(TransferError::Backend(BackendError::NotFound(_)))));
    }
}
