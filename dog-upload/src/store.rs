use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::{
    backend::{BlobBackend, BlobProperties},
    chunking::ChunkSplitter,
    metadata::RawMetadata,
    strategy::{AppendStrategy, BlockStagedStrategy, UploadLocation, UploadStrategy},
    BackendMetadata, ByteStream, ChecksumRegistry, ChecksumVerifier, StrategyKind, UploadConfig, UploadCtx,
    UploadError, UploadId, UploadKeys, UploadMetadataCodec, UploadRecord, UploadResult,
};

/// Where an upload's metadata currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetadataHome {
    Object,
    Pending,
}

/// An upload as read from the backend in one pass
struct ResolvedUpload {
    location: UploadLocation,
    /// `None` for a hidden upload with nothing committed yet
    properties: Option<BlobProperties>,
    metadata: BackendMetadata,
    home: MetadataHome,
    record: UploadRecord,
    strategy: UploadStrategy,
}

/// Resumable upload store.
///
/// The lifecycle contract a protocol adapter talks to. Every call re-derives
/// offset and length from the backend, so several store instances may serve
/// the same backend. Appends to one upload must be serialized by the caller.
#[derive(Clone)]
pub struct UploadStore {
    backend: Arc<dyn BlobBackend>,
    keys: UploadKeys,
    config: UploadConfig,
    default_strategy: StrategyKind,
}

impl UploadStore {
    /// Create a new upload store
    pub fn new<B: BlobBackend + 'static>(backend: B, config: UploadConfig) -> UploadResult<Self> {
        Self::from_arc(Arc::new(backend), config)
    }

    /// Create a store over a shared backend
    pub fn from_arc(backend: Arc<dyn BlobBackend>, config: UploadConfig) -> UploadResult<Self> {
        let capabilities = backend.capabilities();
        let default_strategy = match config.strategy {
            Some(kind) => kind,
            None if capabilities.supports_append => StrategyKind::Append,
            None if capabilities.supports_block_staging => StrategyKind::BlockStaged,
            None => {
                return Err(UploadError::invalid(
                    "Backend supports neither append nor block staging",
                ))
            }
        };

        let supported = match default_strategy {
            StrategyKind::Append => capabilities.supports_append,
            StrategyKind::BlockStaged => capabilities.supports_block_staging,
        };
        if !supported {
            return Err(UploadError::invalid(format!(
                "Backend does not support the {} strategy",
                default_strategy
            )));
        }

        Ok(Self {
            backend,
            keys: UploadKeys::new(config.key_prefix.clone()),
            config,
            default_strategy,
        })
    }

    /// Get configuration
    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Strategy bound to uploads created by this store
    pub fn default_strategy(&self) -> StrategyKind {
        self.default_strategy
    }

    pub fn keys(&self) -> &UploadKeys {
        &self.keys
    }

    pub(crate) fn backend(&self) -> &Arc<dyn BlobBackend> {
        &self.backend
    }

    /// Checksum verifier over this store's backend with the default algorithms
    pub fn checksum_verifier(&self) -> ChecksumVerifier {
        ChecksumVerifier::new(self.backend.clone(), self.keys.clone(), ChecksumRegistry::default())
    }

    fn location(&self, id: &UploadId) -> UploadLocation {
        UploadLocation {
            id: id.clone(),
            object: self.keys.object_key(id),
            pending: self.keys.pending_key(id),
        }
    }

    /// Location of a caller-supplied id; ids outside the key layout are `Invalid`
    fn checked_location(&self, id: &UploadId) -> UploadResult<UploadLocation> {
        if !UploadKeys::is_valid_id(id) {
            return Err(UploadError::invalid(format!("Malformed upload id {:?}", id.as_str())));
        }
        Ok(self.location(id))
    }

    fn strategy(&self, kind: StrategyKind) -> UploadStrategy {
        match kind {
            StrategyKind::Append => {
                UploadStrategy::Append(AppendStrategy::new(self.backend.clone(), self.config.create_is_idempotent))
            }
            StrategyKind::BlockStaged => UploadStrategy::BlockStaged(BlockStagedStrategy::new(
                self.backend.clone(),
                self.config.hide_until_complete,
            )),
        }
    }

    /// Read an upload's properties and metadata, `None` if it does not exist.
    ///
    /// A malformed id names no upload.
    async fn resolve(&self, ctx: &UploadCtx, id: &UploadId) -> UploadResult<Option<ResolvedUpload>> {
        if !UploadKeys::is_valid_id(id) {
            debug!("Ignoring malformed upload id {:?}", id.as_str());
            return Ok(None);
        }
        let location = self.location(id);

        ctx.ensure_active()?;
        let (properties, metadata, home) = match self.backend.get_properties(&location.object).await {
            Ok(properties) => {
                let metadata = properties.metadata.clone();
                (Some(properties), metadata, MetadataHome::Object)
            }
            Err(UploadError::NotFound { .. }) => {
                ctx.ensure_active()?;
                match self.backend.get_properties(&location.pending).await {
                    Ok(marker) => (None, marker.metadata, MetadataHome::Pending),
                    Err(UploadError::NotFound { .. }) => return Ok(None),
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        let record = UploadMetadataCodec::decode(id, &metadata);
        let strategy = self.strategy(record.strategy.unwrap_or(self.default_strategy));

        Ok(Some(ResolvedUpload {
            location,
            properties,
            metadata,
            home,
            record,
            strategy,
        }))
    }

    async fn require(&self, ctx: &UploadCtx, id: &UploadId) -> UploadResult<ResolvedUpload> {
        self.checked_location(id)?;
        self.resolve(ctx, id)
            .await?
            .ok_or_else(|| UploadError::not_found(self.keys.object_key(id)))
    }

    async fn current_offset(&self, ctx: &UploadCtx, upload: &ResolvedUpload) -> UploadResult<u64> {
        upload
            .strategy
            .current_offset(ctx, &upload.location, upload.properties.as_ref())
            .await
    }

    async fn write_metadata(&self, ctx: &UploadCtx, upload: &ResolvedUpload, metadata: &BackendMetadata) -> UploadResult<()> {
        let name = match upload.home {
            MetadataHome::Object => &upload.location.object,
            MetadataHome::Pending => &upload.location.pending,
        };
        ctx.ensure_active()?;
        self.backend.set_metadata(name, metadata).await
    }

    /// Create a new upload.
    ///
    /// `declared_length` is `None` when the length is deferred.
    /// `raw_metadata` is the client's metadata header, kept for echo-back.
    #[instrument(skip(self, ctx, raw_metadata), fields(request_id = %ctx.request_id))]
    pub async fn create_upload(
        &self,
        ctx: UploadCtx,
        declared_length: Option<u64>,
        raw_metadata: &str,
    ) -> UploadResult<UploadId> {
        let parsed = RawMetadata::parse(raw_metadata)?;

        let id = UploadId::new();
        let location = self.location(&id);
        let strategy = self.strategy(self.default_strategy);

        let mut metadata = UploadMetadataCodec::encode(parsed.entries(), declared_length, Utc::now());
        UploadMetadataCodec::set_strategy(&mut metadata, strategy.kind());
        if !parsed.as_str().trim().is_empty() {
            UploadMetadataCodec::set_raw_metadata(&mut metadata, parsed.as_str());
        }

        strategy.create(&ctx, &location, &metadata).await?;

        info!(
            "Created upload {} ({} strategy, length {})",
            id,
            strategy.kind(),
            declared_length.map_or_else(|| "deferred".to_string(), |l| l.to_string())
        );
        Ok(id)
    }

    /// Set the length of an upload created with a deferred length
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn set_declared_length(&self, ctx: UploadCtx, id: &UploadId, length: u64) -> UploadResult<()> {
        let upload = self.require(&ctx, id).await?;

        if let Some(existing) = upload.record.declared_length {
            return Err(UploadError::invalid_state(format!(
                "Upload {} already has a declared length of {}",
                id, existing
            )));
        }

        let offset = self.current_offset(&ctx, &upload).await?;
        if length < offset {
            return Err(UploadError::invalid_state(format!(
                "Declared length {} is below the current offset {} of upload {}",
                length, offset, id
            )));
        }

        let mut metadata = upload.metadata.clone();
        UploadMetadataCodec::set_declared_length(&mut metadata, length);
        self.write_metadata(&ctx, &upload, &metadata).await?;

        debug!("Declared length {} for upload {}", length, id);
        Ok(())
    }

    /// Append `source` at the upload's current offset.
    ///
    /// Returns the bytes written by this call. Writing past the declared
    /// length fails with `InvalidState`; chunks before the offending one may
    /// already be persisted under the append strategy, so callers resume
    /// from [`UploadStore::get_offset`] after any error.
    #[instrument(skip(self, ctx, source), fields(request_id = %ctx.request_id))]
    pub async fn append(&self, ctx: UploadCtx, id: &UploadId, source: ByteStream) -> UploadResult<u64> {
        let upload = self.require(&ctx, id).await?;
        let cursor = upload
            .strategy
            .cursor(&ctx, &upload.location, upload.properties.as_ref())
            .await?;
        let offset = cursor.offset;
        let declared_length = upload.record.declared_length;

        let chunk_size = self
            .config
            .chunking
            .chunk_size_for(declared_length, upload.strategy.max_chunk_bytes());
        let mut chunks = ChunkSplitter::split(&ctx, source, chunk_size);

        if let Some(length) = declared_length {
            chunks = ChunkSplitter::limit(chunks, length.saturating_sub(offset));
        }

        let written = upload
            .strategy
            .append(&ctx, &upload.location, cursor, chunks)
            .await?;

        debug!("Appended {} bytes to upload {} at offset {}", written, id, offset);
        Ok(written)
    }

    /// Bytes persisted so far; 0 if the upload does not exist
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn get_offset(&self, ctx: UploadCtx, id: &UploadId) -> UploadResult<u64> {
        match self.resolve(&ctx, id).await? {
            Some(upload) => self.current_offset(&ctx, &upload).await,
            None => Ok(0),
        }
    }

    /// Declared length; `None` if deferred or the upload does not exist
    pub async fn get_declared_length(&self, ctx: UploadCtx, id: &UploadId) -> UploadResult<Option<u64>> {
        Ok(self
            .resolve(&ctx, id)
            .await?
            .and_then(|upload| upload.record.declared_length))
    }

    /// Metadata header exactly as the client sent it at creation
    pub async fn get_metadata(&self, ctx: UploadCtx, id: &UploadId) -> UploadResult<Option<String>> {
        Ok(self
            .resolve(&ctx, id)
            .await?
            .and_then(|upload| upload.record.raw_metadata))
    }

    /// Full bookkeeping record of an upload
    pub async fn get_record(&self, ctx: UploadCtx, id: &UploadId) -> UploadResult<Option<UploadRecord>> {
        Ok(self.resolve(&ctx, id).await?.map(|upload| upload.record))
    }

    /// Set the time after which the upload may be swept
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn set_expiration(&self, ctx: UploadCtx, id: &UploadId, expires_at: DateTime<Utc>) -> UploadResult<()> {
        let upload = self.require(&ctx, id).await?;

        let mut metadata = upload.metadata.clone();
        UploadMetadataCodec::set_expiration(&mut metadata, expires_at);
        self.write_metadata(&ctx, &upload, &metadata).await
    }

    /// Expiration time; `None` if unset or the upload does not exist
    pub async fn get_expiration(&self, ctx: UploadCtx, id: &UploadId) -> UploadResult<Option<DateTime<Utc>>> {
        Ok(self
            .resolve(&ctx, id)
            .await?
            .and_then(|upload| upload.record.expires_at))
    }

    pub async fn file_exists(&self, ctx: UploadCtx, id: &UploadId) -> UploadResult<bool> {
        Ok(self.resolve(&ctx, id).await?.is_some())
    }

    /// Stream the persisted content of an upload
    pub async fn read_content(&self, ctx: UploadCtx, id: &UploadId) -> UploadResult<ByteStream> {
        let upload = self.require(&ctx, id).await?;
        if upload.properties.is_none() {
            return Ok(Box::pin(futures::stream::empty::<Result<bytes::Bytes, std::io::Error>>()));
        }

        ctx.ensure_active()?;
        self.backend.download(&upload.location.object).await
    }

    /// Delete an upload, returning whether anything was removed
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn delete(&self, ctx: UploadCtx, id: &UploadId) -> UploadResult<bool> {
        let location = self.checked_location(id)?;

        ctx.ensure_active()?;
        let object = self.backend.delete_if_exists(&location.object).await?;
        ctx.ensure_active()?;
        let pending = self.backend.delete_if_exists(&location.pending).await?;

        if object || pending {
            info!("Deleted upload {}", id);
        }
        Ok(object || pending)
    }
}
