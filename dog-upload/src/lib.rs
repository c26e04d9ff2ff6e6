//! # dog-upload: Resumable chunked uploads for DogRS applications
//!
//! `dog-upload` persists large files incrementally into a blob backend and
//! tracks each upload's offset, declared length, metadata and expiration so
//! that an interrupted client can resume where the backend says it stopped.
//!
//! Two backend write models sit behind one contract:
//!
//! - **Append**: objects with a native append primitive. The offset is the
//!   object length.
//! - **Block staged**: stage blocks, then commit an ordered block list in one
//!   all-or-nothing step. The offset is the sum of committed block sizes.
//!
//! ## Quick Start
//!
//! ```rust
//! use dog_upload::prelude::*;
//! use dog_upload::backend::memory::MemoryBlobBackend;
//!
//! # #[tokio::main]
//! # async fn main() -> UploadResult<()> {
//! let store = UploadStore::new(MemoryBlobBackend::new(), UploadConfig::default())?;
//! let ctx = UploadCtx::new();
//!
//! // "filename hello.txt"
//! let id = store.create_upload(ctx.clone(), Some(13), "filename aGVsbG8udHh0").await?;
//!
//! let source: ByteStream = Box::pin(futures::stream::once(async {
//!     Ok::<_, std::io::Error>(bytes::Bytes::from_static(b"Hello, world!"))
//! }));
//! store.append(ctx.clone(), &id, source).await?;
//!
//! assert_eq!(store.get_offset(ctx, &id).await?, 13);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │   Protocol adapter   │  ← HTTP semantics, not in this crate
//! ├──────────────────────┤
//! │     UploadStore      │  ← Lifecycle contract
//! ├──────────────────────┤
//! │    UploadStrategy    │  ← Append / BlockStaged, bound per upload
//! ├──────────────────────┤
//! │     BlobBackend      │  ← Storage primitives
//! └──────────────────────┘
//! ```
//!
//! [`ChecksumVerifier`] and [`ExpirationSweeper`] sit beside the store.
//!
//! Nothing is cached between calls: offset, length and block list are read
//! from the backend every time. Appends to the same upload must be
//! serialized by the caller; under the block staged model two concurrent
//! appends can lose one another's blocks.

pub mod backend;
pub mod checksum;
pub mod chunking;
pub mod config;
pub mod error;
pub mod keys;
pub mod metadata;
pub mod store;
pub mod strategy;
pub mod sweeper;
pub mod types;

pub use backend::{BackendCapabilities, BlobBackend, BlobListing, BlobProperties};
pub use checksum::{ChecksumHasher, ChecksumRegistry, ChecksumVerifier};
pub use chunking::{ChunkSplitter, ChunkStream};
pub use config::{ChunkRules, UploadConfig};
pub use error::{UploadError, UploadResult};
pub use keys::{KeyKind, UploadKeys};
pub use metadata::{RawMetadata, UploadMetadataCodec};
pub use store::UploadStore;
pub use strategy::{AppendCursor, AppendStrategy, BlockStagedStrategy, StrategyKind, UploadStrategy};
pub use sweeper::ExpirationSweeper;
pub use types::*;

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        BlobBackend, ByteStream, Checksum, ChecksumVerifier, ExpirationSweeper, StrategyKind, UploadConfig,
        UploadCtx, UploadError, UploadId, UploadRecord, UploadResult, UploadStore,
    };
}
