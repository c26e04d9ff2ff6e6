use std::sync::Arc;

use futures_util::StreamExt;
use tracing::{debug, warn};

use crate::{
    backend::BlobBackend, chunking::ChunkStream, strategy::UploadLocation, BackendMetadata, BlockId,
    CommittedBlock, UploadCtx, UploadError, UploadMetadataCodec, UploadResult,
};

/// Write logic for stage-then-commit backends.
///
/// The committed block list is the only source of truth for the offset and
/// the next block sequence number; nothing is cached between calls.
///
/// Two concurrent `append` calls on the same upload can read the same block
/// list and the later commit silently drops the earlier one's blocks.
/// Callers must serialize appends per upload.
#[derive(Clone)]
pub struct BlockStagedStrategy {
    backend: Arc<dyn BlobBackend>,
    hide_until_complete: bool,
}

impl BlockStagedStrategy {
    pub fn new(backend: Arc<dyn BlobBackend>, hide_until_complete: bool) -> Self {
        Self {
            backend,
            hide_until_complete,
        }
    }

    pub fn max_chunk_bytes(&self) -> usize {
        self.backend.capabilities().max_block_bytes
    }

    /// Register a new upload.
    ///
    /// When hiding until complete, the content object is not created; the
    /// metadata waits on the pending marker until the first commit.
    pub async fn create_deferred(
        &self,
        ctx: &UploadCtx,
        location: &UploadLocation,
        metadata: &BackendMetadata,
    ) -> UploadResult<()> {
        ctx.ensure_active()?;
        if self.hide_until_complete {
            self.backend.create_empty(&location.pending, metadata).await
        } else {
            self.backend.create_empty(&location.object, metadata).await
        }
    }

    /// Committed blocks in content order; empty if nothing was committed yet
    pub async fn committed_blocks(&self, ctx: &UploadCtx, name: &str) -> UploadResult<Vec<CommittedBlock>> {
        ctx.ensure_active()?;
        match self.backend.list_committed_blocks(name).await {
            Ok(blocks) => Ok(blocks),
            Err(UploadError::NotFound { .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Sum of committed block sizes
    pub async fn get_offset(&self, ctx: &UploadCtx, name: &str) -> UploadResult<u64> {
        let blocks = self.committed_blocks(ctx, name).await?;
        Ok(Self::offset_of(&blocks))
    }

    pub fn offset_of(blocks: &[CommittedBlock]) -> u64 {
        blocks.iter().map(|block| block.size).sum()
    }

    /// Stage every chunk as a new block, then commit them all at once.
    ///
    /// `committed` is the block list the caller read to derive the offset;
    /// new block ids continue its sequence. Any failure before the commit
    /// leaves the committed content untouched and the staged blocks are never
    /// referenced. The metadata is read again right before the commit so
    /// that only the block count changes with it.
    pub async fn append(
        &self,
        ctx: &UploadCtx,
        location: &UploadLocation,
        committed: Vec<CommittedBlock>,
        chunks: ChunkStream,
    ) -> UploadResult<u64> {
        let first_commit = committed.is_empty();

        let mut block_ids: Vec<BlockId> = committed.into_iter().map(|block| block.block_id).collect();
        let previously_committed = block_ids.len();
        let mut written = 0u64;

        let mut chunks = chunks;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            ctx.ensure_active()?;

            let block_id = BlockId::from_sequence(block_ids.len() as u64);
            let len = chunk.len() as u64;
            self.backend.stage_block(&location.object, &block_id, chunk.data).await?;

            debug!("Staged block {} ({} bytes) for {}", block_id, len, location.object);
            block_ids.push(block_id);
            written += len;
        }

        if block_ids.len() == previously_committed {
            return Ok(0);
        }

        let mut metadata = self.current_metadata(ctx, location).await?;
        UploadMetadataCodec::set_block_count(&mut metadata, block_ids.len() as u64);

        ctx.ensure_active()?;
        self.backend
            .commit_block_list(&location.object, &block_ids, Some(&metadata))
            .await?;
        debug!(
            "Committed {} new blocks for {} ({} total)",
            block_ids.len() - previously_committed,
            location.object,
            block_ids.len()
        );

        if first_commit && self.hide_until_complete && !ctx.is_cancelled() {
            if let Err(e) = self.backend.delete_if_exists(&location.pending).await {
                warn!("Failed to remove pending marker {}: {}", location.pending, e);
            }
        }

        Ok(written)
    }

    /// Metadata as stored now, on the object or else on the pending marker
    async fn current_metadata(&self, ctx: &UploadCtx, location: &UploadLocation) -> UploadResult<BackendMetadata> {
        ctx.ensure_active()?;
        match self.backend.get_properties(&location.object).await {
            Ok(properties) => Ok(properties.metadata),
            Err(UploadError::NotFound { .. }) => {
                ctx.ensure_active()?;
                Ok(self.backend.get_properties(&location.pending).await?.metadata)
            }
            Err(e) => Err(e),
        }
    }
}
