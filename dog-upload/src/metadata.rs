//! Upload bookkeeping stored in the backend's flat metadata bag.
//!
//! Internal keys share the `x_upload_` prefix; user keys share the
//! `x_upload_meta_` sub-prefix. User values are base64 encoded since backend
//! metadata values cannot carry arbitrary bytes, and user keys are sanitized
//! to the backend key alphabet (letters, digits, underscore; no leading
//! digit). Sanitization is lossy: distinct keys may collide, in which case
//! the last one wins.
//!
//! Decoding is lenient. Metadata is advisory, so malformed entries are
//! skipped or read as unknown instead of failing the upload.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::debug;

use crate::{BackendMetadata, StrategyKind, UploadError, UploadId, UploadRecord, UploadResult, UserMetadata};

pub const INTERNAL_PREFIX: &str = "x_upload_";
pub const USER_PREFIX: &str = "x_upload_meta_";

pub const LENGTH_KEY: &str = "x_upload_length";
pub const CREATED_KEY: &str = "x_upload_created";
pub const EXPIRES_KEY: &str = "x_upload_expires";
pub const BLOCKS_KEY: &str = "x_upload_blocks";
pub const STRATEGY_KEY: &str = "x_upload_strategy";
pub const RAW_METADATA_KEY: &str = "x_upload_metadata";

/// Encodes and decodes upload bookkeeping
#[derive(Debug, Clone, Copy, Default)]
pub struct UploadMetadataCodec;

impl UploadMetadataCodec {
    /// Encode user metadata and creation bookkeeping into backend metadata
    pub fn encode(
        user_metadata: &UserMetadata,
        declared_length: Option<u64>,
        created_at: DateTime<Utc>,
    ) -> BackendMetadata {
        let mut metadata = BackendMetadata::new();

        for (key, value) in user_metadata {
            metadata.insert(
                format!("{}{}", USER_PREFIX, sanitize_key(key)),
                STANDARD.encode(value.as_bytes()),
            );
        }

        if let Some(length) = declared_length {
            metadata.insert(LENGTH_KEY.to_string(), length.to_string());
        }
        metadata.insert(CREATED_KEY.to_string(), format_timestamp(created_at));

        metadata
    }

    /// Decode backend metadata into an upload record
    pub fn decode(id: &UploadId, metadata: &BackendMetadata) -> UploadRecord {
        let mut user_metadata = UserMetadata::new();

        for (key, value) in metadata {
            let Some(user_key) = key.strip_prefix(USER_PREFIX) else {
                continue;
            };
            match STANDARD.decode(value) {
                Ok(bytes) => {
                    user_metadata.insert(user_key.to_string(), String::from_utf8_lossy(&bytes).into_owned());
                }
                Err(e) => debug!("Skipping malformed metadata entry {} on {}: {}", key, id, e),
            }
        }

        let raw_metadata = metadata
            .get(RAW_METADATA_KEY)
            .and_then(|value| STANDARD.decode(value).ok())
            .and_then(|bytes| String::from_utf8(bytes).ok());

        UploadRecord {
            id: id.clone(),
            declared_length: metadata.get(LENGTH_KEY).and_then(|v| v.trim().parse().ok()),
            created_at: metadata.get(CREATED_KEY).and_then(|v| parse_timestamp(v)),
            expires_at: metadata.get(EXPIRES_KEY).and_then(|v| parse_timestamp(v)),
            block_count: metadata
                .get(BLOCKS_KEY)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0),
            user_metadata,
            raw_metadata,
            strategy: metadata.get(STRATEGY_KEY).and_then(|v| StrategyKind::parse(v)),
        }
    }

    /// Decode only the expiration, for sweeps over many objects
    pub fn decode_expiration(metadata: &BackendMetadata) -> Option<DateTime<Utc>> {
        metadata.get(EXPIRES_KEY).and_then(|v| parse_timestamp(v))
    }

    pub fn set_declared_length(metadata: &mut BackendMetadata, length: u64) {
        metadata.insert(LENGTH_KEY.to_string(), length.to_string());
    }

    pub fn set_expiration(metadata: &mut BackendMetadata, expires_at: DateTime<Utc>) {
        metadata.insert(EXPIRES_KEY.to_string(), format_timestamp(expires_at));
    }

    pub fn set_block_count(metadata: &mut BackendMetadata, block_count: u64) {
        metadata.insert(BLOCKS_KEY.to_string(), block_count.to_string());
    }

    pub fn set_strategy(metadata: &mut BackendMetadata, strategy: StrategyKind) {
        metadata.insert(STRATEGY_KEY.to_string(), strategy.as_str().to_string());
    }

    /// Keep the metadata exactly as the client sent it, for echo-back
    pub fn set_raw_metadata(metadata: &mut BackendMetadata, raw: &str) {
        metadata.insert(RAW_METADATA_KEY.to_string(), STANDARD.encode(raw.as_bytes()));
    }
}

/// Map a user key onto the backend key alphabet
pub fn sanitize_key(key: &str) -> String {
    let mut sanitized: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();

    if sanitized.is_empty() || sanitized.starts_with(|c: char| c.is_ascii_digit()) {
        sanitized.insert(0, '_');
    }
    sanitized
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

/// Upload metadata in the resumable-upload header form:
/// comma separated `key base64value` pairs, value optional.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawMetadata {
    raw: String,
    entries: UserMetadata,
}

impl RawMetadata {
    /// Parse a header value. An empty or blank header has no entries.
    pub fn parse(raw: &str) -> UploadResult<Self> {
        let mut entries = UserMetadata::new();

        for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let mut parts = pair.split(' ');
            let key = parts.next().unwrap_or_default();
            let value = parts.next();
            if parts.next().is_some() {
                return Err(UploadError::invalid(format!("Metadata pair '{}' has too many parts", pair)));
            }

            let value = match value {
                Some(encoded) => {
                    let bytes = STANDARD.decode(encoded).map_err(|e| {
                        UploadError::invalid(format!("Metadata value for '{}' is not base64: {}", key, e))
                    })?;
                    String::from_utf8_lossy(&bytes).into_owned()
                }
                None => String::new(),
            };

            if entries.insert(key.to_string(), value).is_some() {
                return Err(UploadError::invalid(format!("Duplicate metadata key '{}'", key)));
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            entries,
        })
    }

    /// The header exactly as received
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn entries(&self) -> &UserMetadata {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
