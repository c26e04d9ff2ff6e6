//! Write strategies for the two backend write models.
//!
//! [`UploadStrategy`] is the tagged variant the store binds to each upload
//! at creation; the kind is recorded in the upload's metadata so later calls
//! keep using it regardless of configuration changes.

pub mod append;
pub mod staged;

use serde::{Deserialize, Serialize};

use crate::{
    backend::BlobProperties, chunking::ChunkStream, BackendMetadata, CommittedBlock, UploadCtx, UploadId,
    UploadResult,
};

pub use append::AppendStrategy;
pub use staged::BlockStagedStrategy;

/// Which write model an upload uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Append,
    #[serde(rename = "block")]
    BlockStaged,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Append => "append",
            Self::BlockStaged => "block",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "append" => Some(Self::Append),
            "block" => Some(Self::BlockStaged),
            _ => None,
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend object names for one upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadLocation {
    pub id: UploadId,
    /// The object holding the upload's content
    pub object: String,
    /// Metadata marker of a hidden staged upload
    pub pending: String,
}

/// Strategy bound to an upload
#[derive(Clone)]
pub enum UploadStrategy {
    Append(AppendStrategy),
    BlockStaged(BlockStagedStrategy),
}

impl UploadStrategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::Append(_) => StrategyKind::Append,
            Self::BlockStaged(_) => StrategyKind::BlockStaged,
        }
    }

    /// Largest chunk a single backend write accepts
    pub fn max_chunk_bytes(&self) -> usize {
        match self {
            Self::Append(strategy) => strategy.max_chunk_bytes(),
            Self::BlockStaged(strategy) => strategy.max_chunk_bytes(),
        }
    }

    pub async fn create(
        &self,
        ctx: &UploadCtx,
        location: &UploadLocation,
        metadata: &BackendMetadata,
    ) -> UploadResult<()> {
        match self {
            Self::Append(strategy) => strategy.create_empty(ctx, &location.object, metadata).await,
            Self::BlockStaged(strategy) => strategy.create_deferred(ctx, location, metadata).await,
        }
    }

    /// Write `chunks` after the current end of the upload, as read into `cursor`
    pub async fn append(
        &self,
        ctx: &UploadCtx,
        location: &UploadLocation,
        cursor: AppendCursor,
        chunks: ChunkStream,
    ) -> UploadResult<u64> {
        match self {
            Self::Append(strategy) => strategy.append(ctx, &location.object, chunks).await,
            Self::BlockStaged(strategy) => strategy.append(ctx, location, cursor.committed, chunks).await,
        }
    }

    /// Read where the next append starts, from object properties just read.
    ///
    /// `properties` is `None` for a hidden upload without committed content.
    /// The staged strategy lists the committed blocks once here and the same
    /// list feeds the next block ids.
    pub async fn cursor(
        &self,
        ctx: &UploadCtx,
        location: &UploadLocation,
        properties: Option<&BlobProperties>,
    ) -> UploadResult<AppendCursor> {
        match (self, properties) {
            (Self::Append(strategy), properties) => Ok(AppendCursor {
                offset: strategy.get_offset(properties),
                committed: Vec::new(),
            }),
            (Self::BlockStaged(_), None) => Ok(AppendCursor::default()),
            (Self::BlockStaged(strategy), Some(_)) => {
                let committed = strategy.committed_blocks(ctx, &location.object).await?;
                Ok(AppendCursor {
                    offset: BlockStagedStrategy::offset_of(&committed),
                    committed,
                })
            }
        }
    }

    /// Current offset, from object properties just read
    pub async fn current_offset(
        &self,
        ctx: &UploadCtx,
        location: &UploadLocation,
        properties: Option<&BlobProperties>,
    ) -> UploadResult<u64> {
        match (self, properties) {
            (Self::Append(strategy), properties) => Ok(strategy.get_offset(properties)),
            (Self::BlockStaged(_), None) => Ok(0),
            (Self::BlockStaged(strategy), Some(_)) => strategy.get_offset(ctx, &location.object).await,
        }
    }
}

/// End of an upload's committed content
#[derive(Debug, Clone, Default)]
pub struct AppendCursor {
    pub offset: u64,
    /// Committed block list, staged strategy only
    pub committed: Vec<CommittedBlock>,
}
