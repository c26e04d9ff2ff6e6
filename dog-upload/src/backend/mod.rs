#[cfg(feature = "memory")]
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use futures_core::Stream;
use std::pin::Pin;

use crate::{BackendMetadata, BlockId, ByteStream, CommittedBlock, UploadError, UploadResult};

/// Type alias for boxed streams (stable Rust compatible)
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Storage primitives an upload backend must provide.
///
/// A backend implements the common operations plus either the append-only
/// write model or the stage-then-commit model; the operations of the model
/// it lacks keep their `Unsupported` defaults. Not-found conditions are
/// reported as [`UploadError::NotFound`].
#[async_trait]
pub trait BlobBackend: Send + Sync {
    /// Create a zero-length object. Fails with `AlreadyExists` if it exists.
    async fn create_empty(&self, name: &str, metadata: &BackendMetadata) -> UploadResult<()>;

    /// Append bytes to the end of an existing object
    async fn append_block(&self, _name: &str, _data: Bytes) -> UploadResult<()> {
        Err(UploadError::Unsupported {
            operation: "append_block",
        })
    }

    /// Stage an uncommitted block for an object that may not exist yet
    async fn stage_block(&self, _name: &str, _block_id: &BlockId, _data: Bytes) -> UploadResult<()> {
        Err(UploadError::Unsupported {
            operation: "stage_block",
        })
    }

    /// Replace the object's content with the given blocks, in order.
    ///
    /// All-or-nothing. The object is created if missing. `None` metadata
    /// keeps the object's current metadata.
    async fn commit_block_list(
        &self,
        _name: &str,
        _block_ids: &[BlockId],
        _metadata: Option<&BackendMetadata>,
    ) -> UploadResult<()> {
        Err(UploadError::Unsupported {
            operation: "commit_block_list",
        })
    }

    /// Committed blocks of an object, in content order
    async fn list_committed_blocks(&self, _name: &str) -> UploadResult<Vec<CommittedBlock>> {
        Err(UploadError::Unsupported {
            operation: "list_committed_blocks",
        })
    }

    /// Length, etag and metadata of an object
    async fn get_properties(&self, name: &str) -> UploadResult<BlobProperties>;

    /// Replace an object's metadata
    async fn set_metadata(&self, name: &str, metadata: &BackendMetadata) -> UploadResult<()>;

    /// Stream an object's committed content
    async fn download(&self, name: &str) -> UploadResult<ByteStream>;

    /// Delete an object, returning whether it existed
    async fn delete_if_exists(&self, name: &str) -> UploadResult<bool>;

    /// List objects whose names start with `prefix`
    fn list(&self, prefix: &str) -> BoxStream<UploadResult<BlobListing>>;

    /// Get backend capabilities
    fn capabilities(&self) -> BackendCapabilities;
}

/// Properties of a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobProperties {
    pub length: u64,
    pub etag: Option<String>,
    pub metadata: BackendMetadata,
}

/// One entry of a backend listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobListing {
    pub name: String,
    pub metadata: BackendMetadata,
}

/// Backend capabilities
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub supports_append: bool,
    pub supports_block_staging: bool,
    /// Largest single append call
    pub max_append_bytes: usize,
    /// Largest single staged block
    pub max_block_bytes: usize,
}

impl BackendCapabilities {
    /// Append-only backend
    pub fn append(max_append_bytes: usize) -> Self {
        Self {
            supports_append: true,
            supports_block_staging: false,
            max_append_bytes,
            max_block_bytes: 0,
        }
    }

    /// Stage-then-commit backend
    pub fn block_staged(max_block_bytes: usize) -> Self {
        Self {
            supports_append: false,
            supports_block_staging: true,
            max_append_bytes: 0,
            max_block_bytes,
        }
    }

    pub fn with_block_staging(mut self, max_block_bytes: usize) -> Self {
        self.supports_block_staging = true;
        self.max_block_bytes = max_block_bytes;
        self
    }

    pub fn with_append(mut self, max_append_bytes: usize) -> Self {
        self.supports_append = true;
        self.max_append_bytes = max_append_bytes;
        self
    }
}
