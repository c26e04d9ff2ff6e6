use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{StrategyKind, UploadError, UploadResult};

/// Stream of bytes for upload content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Flat key/value metadata bag as stored on a backend object
pub type BackendMetadata = BTreeMap<String, String>;

/// User-visible upload metadata
pub type UserMetadata = BTreeMap<String, String>;

/// Unique identifier for an upload
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UploadId(pub String);

impl UploadId {
    /// Generate a new random upload ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Create from existing string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UploadId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Context for upload operations (request correlation and cancellation)
#[derive(Debug, Clone)]
pub struct UploadCtx {
    pub request_id: String,
    pub cancel: CancellationToken,
}

impl UploadCtx {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_request_id(mut self, request_id: String) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail with `Cancelled` if cancellation was requested.
    ///
    /// Called before every backend call; a call already in flight is never interrupted.
    pub fn ensure_active(&self) -> UploadResult<()> {
        if self.cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        Ok(())
    }
}

impl Default for UploadCtx {
    fn default() -> Self {
        Self::new()
    }
}

/// Bookkeeping for one upload, decoded from backend metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: UploadId,
    /// `None` while the length is deferred
    pub declared_length: Option<u64>,
    /// `None` when the stored value is missing or unreadable
    pub created_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Advisory only, never used to compute the offset
    pub block_count: u64,
    pub user_metadata: UserMetadata,
    /// Metadata in the form the client sent it
    pub raw_metadata: Option<String>,
    pub strategy: Option<StrategyKind>,
}

impl UploadRecord {
    pub fn is_length_deferred(&self) -> bool {
        self.declared_length.is_none()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }
}

/// Position and size of one chunk produced by the splitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub sequence_number: u64,
    pub byte_length: usize,
}

/// A chunk of upload content
#[derive(Debug, Clone)]
pub struct Chunk {
    pub descriptor: ChunkDescriptor,
    pub data: Bytes,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

const BLOCK_ID_WIDTH: usize = 12;

/// Identifier of a staged block.
///
/// Fixed-width zero-padded decimal of the block's sequence number, so
/// lexicographic order matches numeric order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(String);

impl BlockId {
    pub fn from_sequence(sequence_number: u64) -> Self {
        Self(format!("{:0width$}", sequence_number, width = BLOCK_ID_WIDTH))
    }

    /// Parse an id produced by [`BlockId::from_sequence`]
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.len() == BLOCK_ID_WIDTH && raw.bytes().all(|b| b.is_ascii_digit()) {
            Some(Self(raw.to_string()))
        } else {
            None
        }
    }

    pub fn sequence_number(&self) -> u64 {
        self.0.parse().unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A block that is part of an object's committed block list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedBlock {
    pub block_id: BlockId,
    pub size: u64,
}

/// Client-declared digest of an upload's content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: String,
    pub expected: Vec<u8>,
}

impl Checksum {
    pub fn new<S: Into<String>>(algorithm: S, expected: Vec<u8>) -> Self {
        Self {
            algorithm: algorithm.into(),
            expected,
        }
    }

    /// Parse the `<algorithm> <base64 digest>` header form
    pub fn parse(header: &str) -> UploadResult<Self> {
        let mut parts = header.trim().splitn(2, ' ');
        let algorithm = parts.next().unwrap_or_default();
        let encoded = parts
            .next()
            .ok_or_else(|| UploadError::invalid("Checksum must be '<algorithm> <base64 digest>'"))?;

        if algorithm.is_empty() {
            return Err(UploadError::invalid("Checksum algorithm is empty"));
        }

        let expected = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| UploadError::invalid(format!("Checksum digest is not base64: {}", e)))?;

        Ok(Self::new(algorithm, expected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_ids_sort_numerically() {
        let mut ids: Vec<BlockId> = [10u64, 2, 100, 1].iter().map(|n| BlockId::from_sequence(*n)).collect();
        ids.sort();
        let order: Vec<u64> = ids.iter().map(BlockId::sequence_number).collect();
        assert_eq!(order, vec![1, 2, 10, 100]);
        assert_eq!(BlockId::from_sequence(7).as_str(), "000000000007");
    }

    #[test]
    fn block_id_parse_rejects_foreign_ids() {
        assert!(BlockId::parse("000000000003").is_some());
        assert!(BlockId::parse("3").is_none());
        assert!(BlockId::parse("00000000000x").is_none());
    }

    #[test]
    fn checksum_header_parses() {
        let checksum = Checksum::parse("sha1 Kq5sNclPz7QV2+lfQIuc6R7oRu0=").unwrap();
        assert_eq!(checksum.algorithm, "sha1");
        assert_eq!(checksum.expected.len(), 20);

        assert!(Checksum::parse("sha1").is_err());
        assert!(Checksum::parse("sha1 not*base64").is_err());
    }

    #[test]
    fn cancelled_ctx_refuses_work() {
        let ctx = UploadCtx::new();
        assert!(ctx.ensure_active().is_ok());
        ctx.cancel.cancel();
        assert!(ctx.ensure_active().unwrap_err().is_cancelled());
    }
}
