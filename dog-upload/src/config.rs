use serde::{Deserialize, Serialize};

use crate::StrategyKind;

/// Configuration for the upload store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Every upload object is named `{key_prefix}/{id}`
    pub key_prefix: String,

    /// Strategy bound to new uploads. `None` picks from backend capabilities.
    pub strategy: Option<StrategyKind>,

    /// Accept an existing object on create instead of failing (append strategy)
    pub create_is_idempotent: bool,

    /// Defer physical object creation until the first commit (staged strategy)
    pub hide_until_complete: bool,

    /// Rules for sizing chunks written to the backend
    pub chunking: ChunkRules,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            key_prefix: "uploads".to_string(),
            strategy: None,
            create_is_idempotent: false,
            hide_until_complete: false,
            chunking: ChunkRules::default(),
        }
    }
}

impl UploadConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the object key prefix (trailing slashes are dropped)
    pub fn with_key_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.key_prefix = prefix.into().trim_end_matches('/').to_string();
        self
    }

    /// Pin the strategy used for new uploads
    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Treat create of an existing object as success
    pub fn create_idempotent(mut self) -> Self {
        self.create_is_idempotent = true;
        self
    }

    /// Hide staged uploads until their first commit
    pub fn hide_until_complete(mut self) -> Self {
        self.hide_until_complete = true;
        self
    }

    /// Set chunking rules
    pub fn with_chunking(mut self, rules: ChunkRules) -> Self {
        self.chunking = rules;
        self
    }
}

/// Chunk sizing rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRules {
    /// Chunk size for uploads below `large_upload_threshold`
    pub small_chunk_bytes: usize,

    /// Chunk size while the declared length is deferred
    pub default_chunk_bytes: usize,

    /// Declared lengths at or above this use the backend maximum
    pub large_upload_threshold: u64,
}

impl Default for ChunkRules {
    fn default() -> Self {
        Self {
            small_chunk_bytes: 1024 * 1024,           // 1MB
            default_chunk_bytes: 4 * 1024 * 1024,     // 4MB
            large_upload_threshold: 64 * 1024 * 1024, // 64MB
        }
    }
}

impl ChunkRules {
    /// Create new chunk rules
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_small_chunk_bytes(mut self, bytes: usize) -> Self {
        self.small_chunk_bytes = bytes;
        self
    }

    pub fn with_default_chunk_bytes(mut self, bytes: usize) -> Self {
        self.default_chunk_bytes = bytes;
        self
    }

    pub fn with_large_upload_threshold(mut self, bytes: u64) -> Self {
        self.large_upload_threshold = bytes;
        self
    }

    /// Pick the chunk size for an upload.
    ///
    /// Deferred uploads use the fixed default, small uploads the small bound
    /// and large uploads the backend maximum. The result never exceeds
    /// `backend_max` and is at least one byte.
    pub fn chunk_size_for(&self, declared_length: Option<u64>, backend_max: usize) -> usize {
        let preferred = match declared_length {
            None => self.default_chunk_bytes,
            Some(len) if len < self.large_upload_threshold => self.small_chunk_bytes,
            Some(_) => backend_max,
        };
        preferred.min(backend_max).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_follows_declared_length() {
        let rules = ChunkRules::new()
            .with_small_chunk_bytes(10)
            .with_default_chunk_bytes(20)
            .with_large_upload_threshold(1000);

        assert_eq!(rules.chunk_size_for(None, 100), 20);
        assert_eq!(rules.chunk_size_for(Some(999), 100), 10);
        assert_eq!(rules.chunk_size_for(Some(1000), 100), 100);
    }

    #[test]
    fn chunk_size_is_clamped_to_backend_max() {
        let rules = ChunkRules::new().with_default_chunk_bytes(64);
        assert_eq!(rules.chunk_size_for(None, 16), 16);

        let zero = ChunkRules::new().with_small_chunk_bytes(0);
        assert_eq!(zero.chunk_size_for(Some(1), 16), 1);
    }

    #[test]
    fn key_prefix_drops_trailing_slash() {
        let config = UploadConfig::new().with_key_prefix("files/");
        assert_eq!(config.key_prefix, "files");
    }
}
