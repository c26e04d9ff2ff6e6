use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::{
    backend::{BackendCapabilities, BlobBackend, BlobListing, BlobProperties, BoxStream},
    BackendMetadata, BlockId, ByteStream, CommittedBlock, UploadError, UploadResult,
};

const MAX_APPEND_BYTES: usize = 4 * 1024 * 1024; // 4MB
const MAX_BLOCK_BYTES: usize = 100 * 1024 * 1024; // 100MB

/// Backend operations, for fault injection and call accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    CreateEmpty,
    AppendBlock,
    StageBlock,
    CommitBlockList,
    ListCommittedBlocks,
    GetProperties,
    SetMetadata,
    Download,
    Delete,
    List,
}

/// Error produced by an injected fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Transient,
    Fatal,
}

#[derive(Debug)]
struct Fault {
    op: BackendOp,
    skip: usize,
    kind: FaultKind,
    name: Option<String>,
}

#[derive(Debug, Default)]
struct MemoryObject {
    blocks: Vec<(Option<BlockId>, Bytes)>,
    metadata: BackendMetadata,
    version: u64,
}

impl MemoryObject {
    fn length(&self) -> u64 {
        self.blocks.iter().map(|(_, data)| data.len() as u64).sum()
    }

    fn touch(&mut self) {
        self.version += 1;
    }
}

/// In-memory blob backend for testing and development.
///
/// Supports the append-only model, the stage-then-commit model, or both.
/// Clones share storage.
#[derive(Clone)]
pub struct MemoryBlobBackend {
    objects: Arc<RwLock<BTreeMap<String, MemoryObject>>>,
    /// Uncommitted blocks: object name -> block id -> data
    staged: Arc<RwLock<HashMap<String, HashMap<BlockId, Bytes>>>>,
    faults: Arc<Mutex<Vec<Fault>>>,
    calls: Arc<Mutex<HashMap<BackendOp, usize>>>,
    capabilities: BackendCapabilities,
    yield_on_call: bool,
}

impl MemoryBlobBackend {
    /// Backend supporting both write models
    pub fn new() -> Self {
        Self::with_capabilities(
            BackendCapabilities::append(MAX_APPEND_BYTES).with_block_staging(MAX_BLOCK_BYTES),
        )
    }

    /// Append-only backend
    pub fn append_only() -> Self {
        Self::with_capabilities(BackendCapabilities::append(MAX_APPEND_BYTES))
    }

    /// Stage-then-commit backend
    pub fn block_staged() -> Self {
        Self::with_capabilities(BackendCapabilities::block_staged(MAX_BLOCK_BYTES))
    }

    pub fn with_capabilities(capabilities: BackendCapabilities) -> Self {
        Self {
            objects: Arc::new(RwLock::new(BTreeMap::new())),
            staged: Arc::new(RwLock::new(HashMap::new())),
            faults: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(Mutex::new(HashMap::new())),
            capabilities,
            yield_on_call: false,
        }
    }

    /// Yield to the runtime at the start of every call so concurrent
    /// callers interleave like they would against a remote backend
    pub fn yielding(mut self) -> Self {
        self.yield_on_call = true;
        self
    }

    /// Fail the next call of `op` without side effects (test helper)
    pub fn fail_next(&self, op: BackendOp, kind: FaultKind) {
        self.fail_after(op, 0, kind);
    }

    /// Let `skip` calls of `op` succeed, then fail the one after (test helper)
    pub fn fail_after(&self, op: BackendOp, skip: usize, kind: FaultKind) {
        self.faults.lock().push(Fault {
            op,
            skip,
            kind,
            name: None,
        });
    }

    /// Fail the next call of `op` that targets `name` (test helper)
    pub fn fail_next_for(&self, op: BackendOp, name: &str, kind: FaultKind) {
        self.faults.lock().push(Fault {
            op,
            skip: 0,
            kind,
            name: Some(name.to_string()),
        });
    }

    /// Number of calls made for `op` so far (test helper)
    pub fn call_count(&self, op: BackendOp) -> usize {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    /// Whether an object exists (test helper)
    pub fn contains(&self, name: &str) -> bool {
        self.objects.read().contains_key(name)
    }

    /// Number of uncommitted blocks held for `name` (test helper)
    pub fn staged_block_count(&self, name: &str) -> usize {
        self.staged.read().get(name).map_or(0, HashMap::len)
    }

    /// Committed content of an object, concatenated (test helper)
    pub fn content(&self, name: &str) -> Option<Vec<u8>> {
        self.objects.read().get(name).map(|object| {
            object
                .blocks
                .iter()
                .flat_map(|(_, data)| data.iter().copied())
                .collect()
        })
    }

    async fn enter(&self, op: BackendOp, name: &str) -> UploadResult<()> {
        if self.yield_on_call {
            tokio::task::yield_now().await;
        }

        *self.calls.lock().entry(op).or_default() += 1;

        let mut faults = self.faults.lock();
        let position = faults.iter().position(|fault| {
            fault.op == op && fault.name.as_deref().map_or(true, |n| n == name)
        });

        if let Some(index) = position {
            if faults[index].skip > 0 {
                faults[index].skip -= 1;
                return Ok(());
            }
            let fault = faults.remove(index);
            return Err(fault_error(fault.kind, op, name));
        }

        Ok(())
    }
}

impl Default for MemoryBlobBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn fault_error(kind: FaultKind, op: BackendOp, name: &str) -> UploadError {
    let message = format!("injected {:?} failure on {}", op, name);
    match kind {
        FaultKind::Transient => {
            UploadError::transient(std::io::Error::new(std::io::ErrorKind::TimedOut, message))
        }
        FaultKind::Fatal => {
            UploadError::fatal(std::io::Error::new(std::io::ErrorKind::PermissionDenied, message))
        }
    }
}

#[async_trait]
impl BlobBackend for MemoryBlobBackend {
    async fn create_empty(&self, name: &str, metadata: &BackendMetadata) -> UploadResult<()> {
        self.enter(BackendOp::CreateEmpty, name).await?;

        let mut objects = self.objects.write();
        if objects.contains_key(name) {
            return Err(UploadError::already_exists(name));
        }

        objects.insert(
            name.to_string(),
            MemoryObject {
                blocks: Vec::new(),
                metadata: metadata.clone(),
                version: 1,
            },
        );
        Ok(())
    }

    async fn append_block(&self, name: &str, data: Bytes) -> UploadResult<()> {
        self.enter(BackendOp::AppendBlock, name).await?;

        if !self.capabilities.supports_append {
            return Err(UploadError::Unsupported {
                operation: "append_block",
            });
        }
        if data.len() > self.capabilities.max_append_bytes {
            return Err(UploadError::invalid(format!(
                "Append of {} bytes exceeds maximum {}",
                data.len(),
                self.capabilities.max_append_bytes
            )));
        }

        let mut objects = self.objects.write();
        let object = objects
            .get_mut(name)
            .ok_or_else(|| UploadError::not_found(name))?;
        object.blocks.push((None, data));
        object.touch();
        Ok(())
    }

    async fn stage_block(&self, name: &str, block_id: &BlockId, data: Bytes) -> UploadResult<()> {
        self.enter(BackendOp::StageBlock, name).await?;

        if !self.capabilities.supports_block_staging {
            return Err(UploadError::Unsupported {
                operation: "stage_block",
            });
        }
        if data.len() > self.capabilities.max_block_bytes {
            return Err(UploadError::invalid(format!(
                "Block of {} bytes exceeds maximum {}",
                data.len(),
                self.capabilities.max_block_bytes
            )));
        }

        self.staged
            .write()
            .entry(name.to_string())
            .or_default()
            .insert(block_id.clone(), data);
        Ok(())
    }

    async fn commit_block_list(
        &self,
        name: &str,
        block_ids: &[BlockId],
        metadata: Option<&BackendMetadata>,
    ) -> UploadResult<()> {
        self.enter(BackendOp::CommitBlockList, name).await?;

        if !self.capabilities.supports_block_staging {
            return Err(UploadError::Unsupported {
                operation: "commit_block_list",
            });
        }

        let mut objects = self.objects.write();
        let mut staged = self.staged.write();
        let pending = staged.get(name);

        // Resolve every block before touching the object.
        let mut blocks = Vec::with_capacity(block_ids.len());
        for block_id in block_ids {
            let data = pending
                .and_then(|blocks| blocks.get(block_id).cloned())
                .or_else(|| {
                    objects.get(name).and_then(|object| {
                        object
                            .blocks
                            .iter()
                            .find(|(id, _)| id.as_ref() == Some(block_id))
                            .map(|(_, data)| data.clone())
                    })
                })
                .ok_or_else(|| {
                    UploadError::invalid(format!("Block {} of {} is neither staged nor committed", block_id, name))
                })?;
            blocks.push((Some(block_id.clone()), data));
        }

        let object = objects.entry(name.to_string()).or_default();
        object.blocks = blocks;
        if let Some(metadata) = metadata {
            object.metadata = metadata.clone();
        }
        object.touch();
        staged.remove(name);
        Ok(())
    }

    async fn list_committed_blocks(&self, name: &str) -> UploadResult<Vec<CommittedBlock>> {
        self.enter(BackendOp::ListCommittedBlocks, name).await?;

        let objects = self.objects.read();
        let object = objects.get(name).ok_or_else(|| UploadError::not_found(name))?;
        Ok(object
            .blocks
            .iter()
            .filter_map(|(id, data)| {
                id.as_ref().map(|block_id| CommittedBlock {
                    block_id: block_id.clone(),
                    size: data.len() as u64,
                })
            })
            .collect())
    }

    async fn get_properties(&self, name: &str) -> UploadResult<BlobProperties> {
        self.enter(BackendOp::GetProperties, name).await?;

        let objects = self.objects.read();
        let object = objects.get(name).ok_or_else(|| UploadError::not_found(name))?;
        Ok(BlobProperties {
            length: object.length(),
            etag: Some(format!("\"{}\"", object.version)),
            metadata: object.metadata.clone(),
        })
    }

    async fn set_metadata(&self, name: &str, metadata: &BackendMetadata) -> UploadResult<()> {
        self.enter(BackendOp::SetMetadata, name).await?;

        let mut objects = self.objects.write();
        let object = objects
            .get_mut(name)
            .ok_or_else(|| UploadError::not_found(name))?;
        object.metadata = metadata.clone();
        object.touch();
        Ok(())
    }

    async fn download(&self, name: &str) -> UploadResult<ByteStream> {
        self.enter(BackendOp::Download, name).await?;

        let chunks: Vec<Result<Bytes, std::io::Error>> = {
            let objects = self.objects.read();
            let object = objects.get(name).ok_or_else(|| UploadError::not_found(name))?;
            object.blocks.iter().map(|(_, data)| Ok(data.clone())).collect()
        };
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn delete_if_exists(&self, name: &str) -> UploadResult<bool> {
        self.enter(BackendOp::Delete, name).await?;

        self.staged.write().remove(name);
        Ok(self.objects.write().remove(name).is_some())
    }

    fn list(&self, prefix: &str) -> BoxStream<UploadResult<BlobListing>> {
        let backend = self.clone();
        let prefix = prefix.to_string();

        Box::pin(async_stream::stream! {
            if let Err(e) = backend.enter(BackendOp::List, &prefix).await {
                yield Err(e);
                return;
            }

            let listings: Vec<BlobListing> = backend
                .objects
                .read()
                .iter()
                .filter(|(name, _)| name.starts_with(&prefix))
                .map(|(name, object)| BlobListing {
                    name: name.clone(),
                    metadata: object.metadata.clone(),
                })
                .collect();

            for listing in listings {
                yield Ok(listing);
            }
        })
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn block(n: u64) -> BlockId {
        BlockId::from_sequence(n)
    }

    #[tokio::test]
    async fn append_grows_object() {
        let backend = MemoryBlobBackend::append_only();
        backend.create_empty("a", &BackendMetadata::new()).await.unwrap();
        backend.append_block("a", Bytes::from_static(b"abc")).await.unwrap();
        backend.append_block("a", Bytes::from_static(b"de")).await.unwrap();

        let props = backend.get_properties("a").await.unwrap();
        assert_eq!(props.length, 5);
        assert_eq!(backend.content("a").unwrap(), b"abcde");
    }

    #[tokio::test]
    async fn create_twice_fails() {
        let backend = MemoryBlobBackend::new();
        backend.create_empty("a", &BackendMetadata::new()).await.unwrap();
        let err = backend.create_empty("a", &BackendMetadata::new()).await.unwrap_err();
        assert!(matches!(err, UploadError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn commit_with_unknown_block_changes_nothing() {
        let backend = MemoryBlobBackend::block_staged();
        backend.stage_block("a", &block(0), Bytes::from_static(b"xy")).await.unwrap();
        backend.commit_block_list("a", &[block(0)], None).await.unwrap();

        backend.stage_block("a", &block(1), Bytes::from_static(b"z")).await.unwrap();
        let err = backend
            .commit_block_list("a", &[block(0), block(1), block(2)], None)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Invalid { .. }));
        assert_eq!(backend.content("a").unwrap(), b"xy");
        assert_eq!(backend.staged_block_count("a"), 1);
    }

    #[tokio::test]
    async fn recommit_keeps_committed_blocks() {
        let backend = MemoryBlobBackend::block_staged();
        backend.stage_block("a", &block(0), Bytes::from_static(b"ab")).await.unwrap();
        backend.commit_block_list("a", &[block(0)], None).await.unwrap();
        backend.stage_block("a", &block(1), Bytes::from_static(b"cd")).await.unwrap();
        backend.commit_block_list("a", &[block(0), block(1)], None).await.unwrap();

        let blocks = backend.list_committed_blocks("a").await.unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(backend.content("a").unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn injected_fault_fires_once() {
        let backend = MemoryBlobBackend::append_only();
        backend.create_empty("a", &BackendMetadata::new()).await.unwrap();
        backend.fail_after(BackendOp::AppendBlock, 1, FaultKind::Transient);

        backend.append_block("a", Bytes::from_static(b"1")).await.unwrap();
        let err = backend.append_block("a", Bytes::from_static(b"2")).await.unwrap_err();
        assert!(err.is_retryable());
        backend.append_block("a", Bytes::from_static(b"3")).await.unwrap();

        assert_eq!(backend.content("a").unwrap(), b"13");
        assert_eq!(backend.call_count(BackendOp::AppendBlock), 3);
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let backend = MemoryBlobBackend::new();
        for name in ["up/a", "up/b", "other/c"] {
            backend.create_empty(name, &BackendMetadata::new()).await.unwrap();
        }

        let names: Vec<String> = backend
            .list("up/")
            .map(|item| item.unwrap().name)
            .collect()
            .await;
        assert_eq!(names, vec!["up/a".to_string(), "up/b".to_string()]);
    }
}
