use std::sync::Arc;

use futures_util::StreamExt;
use tracing::{debug, warn};

use crate::{
    backend::{BlobBackend, BlobProperties}, chunking::ChunkStream, BackendMetadata, Chunk, UploadCtx, UploadError,
    UploadResult,
};

/// Write logic for backends with a native append primitive.
///
/// The offset is the object's length. Each chunk is one append call, so a
/// failure part way through a call keeps every chunk appended before it.
#[derive(Clone)]
pub struct AppendStrategy {
    backend: Arc<dyn BlobBackend>,
    create_is_idempotent: bool,
}

impl AppendStrategy {
    pub fn new(backend: Arc<dyn BlobBackend>, create_is_idempotent: bool) -> Self {
        Self {
            backend,
            create_is_idempotent,
        }
    }

    pub fn max_chunk_bytes(&self) -> usize {
        self.backend.capabilities().max_append_bytes
    }

    /// Create the zero-length object for a new upload
    pub async fn create_empty(&self, ctx: &UploadCtx, name: &str, metadata: &BackendMetadata) -> UploadResult<()> {
        ctx.ensure_active()?;
        match self.backend.create_empty(name, metadata).await {
            Err(UploadError::AlreadyExists { .. }) if self.create_is_idempotent => {
                debug!("Object {} already exists, accepting idempotent create", name);
                Ok(())
            }
            other => other,
        }
    }

    /// Append every chunk, returning the bytes written by this call
    pub async fn append(&self, ctx: &UploadCtx, name: &str, chunks: ChunkStream) -> UploadResult<u64> {
        let mut chunks = chunks;
        let mut written = 0u64;

        while let Some(chunk) = chunks.next().await {
            match self.append_chunk(ctx, name, chunk).await {
                Ok(len) => written += len,
                Err(e) => {
                    if written > 0 {
                        warn!("Append to {} stopped after {} bytes: {}", name, written, e);
                    }
                    return Err(e);
                }
            }
        }

        Ok(written)
    }

    async fn append_chunk(&self, ctx: &UploadCtx, name: &str, chunk: UploadResult<Chunk>) -> UploadResult<u64> {
        let chunk = chunk?;
        ctx.ensure_active()?;
        let len = chunk.len() as u64;
        self.backend.append_block(name, chunk.data).await?;
        Ok(len)
    }

    /// Backend-reported length; a missing object has nothing written yet
    pub fn get_offset(&self, properties: Option<&BlobProperties>) -> u64 {
        properties.map_or(0, |properties| properties.length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{BackendOp, FaultKind, MemoryBlobBackend};
    use crate::chunking::ChunkSplitter;
    use crate::ByteStream;
    use bytes::Bytes;

    fn source(data: &'static [u8]) -> ByteStream {
        Box::pin(futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(data))]))
    }

    #[tokio::test]
    async fn partial_failure_keeps_earlier_chunks() {
        let backend = MemoryBlobBackend::append_only();
        let strategy = AppendStrategy::new(Arc::new(backend.clone()), false);
        let ctx = UploadCtx::new();

        strategy.create_empty(&ctx, "u", &BackendMetadata::new()).await.unwrap();
        backend.fail_after(BackendOp::AppendBlock, 2, FaultKind::Transient);

        let chunks = ChunkSplitter::split(&ctx, source(b"0123456789"), 3);
        let err = strategy.append(&ctx, "u", chunks).await.unwrap_err();
        assert!(err.is_retryable());
        let properties = backend.get_properties("u").await.unwrap();
        assert_eq!(strategy.get_offset(Some(&properties)), 6);
        assert_eq!(backend.content("u").unwrap(), b"012345");
    }

    #[tokio::test]
    async fn idempotent_create_accepts_existing_object() {
        let backend = Arc::new(MemoryBlobBackend::append_only());
        let ctx = UploadCtx::new();

        let strict = AppendStrategy::new(backend.clone(), false);
        strict.create_empty(&ctx, "u", &BackendMetadata::new()).await.unwrap();
        assert!(matches!(
            strict.create_empty(&ctx, "u", &BackendMetadata::new()).await,
            Err(UploadError::AlreadyExists { .. })
        ));

        let lenient = AppendStrategy::new(backend, true);
        lenient.create_empty(&ctx, "u", &BackendMetadata::new()).await.unwrap();
    }

    #[test]
    fn missing_object_has_no_offset() {
        let strategy = AppendStrategy::new(Arc::new(MemoryBlobBackend::append_only()), false);
        assert_eq!(strategy.get_offset(None), 0);
    }
}
