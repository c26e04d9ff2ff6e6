use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use sha2::Digest;
use tracing::{debug, instrument};

use crate::{backend::BlobBackend, UploadCtx, UploadError, UploadId, UploadKeys, UploadResult};

/// Incremental hash over streamed content
pub trait ChecksumHasher: Send {
    fn update(&mut self, data: &[u8]);

    fn finalize(self: Box<Self>) -> Vec<u8>;
}

/// Adapts any RustCrypto digest
struct DigestHasher<D>(D);

impl<D: Digest + Send> ChecksumHasher for DigestHasher<D> {
    fn update(&mut self, data: &[u8]) {
        Digest::update(&mut self.0, data);
    }

    fn finalize(self: Box<Self>) -> Vec<u8> {
        self.0.finalize().to_vec()
    }
}

struct Md5Hasher(md5::Context);

impl ChecksumHasher for Md5Hasher {
    fn update(&mut self, data: &[u8]) {
        self.0.consume(data);
    }

    fn finalize(self: Box<Self>) -> Vec<u8> {
        self.0.compute().0.to_vec()
    }
}

type HasherFactory = Arc<dyn Fn() -> Box<dyn ChecksumHasher> + Send + Sync>;

/// Case-insensitive algorithm name to hasher constructor
#[derive(Clone)]
pub struct ChecksumRegistry {
    factories: HashMap<String, HasherFactory>,
}

impl ChecksumRegistry {
    /// Registry with no algorithms
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, algorithm: &str, factory: F)
    where
        F: Fn() -> Box<dyn ChecksumHasher> + Send + Sync + 'static,
    {
        self.factories.insert(algorithm.to_ascii_lowercase(), Arc::new(factory));
    }

    pub fn with_algorithm<F>(mut self, algorithm: &str, factory: F) -> Self
    where
        F: Fn() -> Box<dyn ChecksumHasher> + Send + Sync + 'static,
    {
        self.register(algorithm, factory);
        self
    }

    pub fn is_supported(&self, algorithm: &str) -> bool {
        self.factories.contains_key(&algorithm.to_ascii_lowercase())
    }

    /// Registered names, sorted
    pub fn supported_algorithms(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn hasher(&self, algorithm: &str) -> UploadResult<Box<dyn ChecksumHasher>> {
        self.factories
            .get(&algorithm.to_ascii_lowercase())
            .map(|factory| factory())
            .ok_or_else(|| UploadError::unsupported_algorithm(algorithm))
    }
}

impl Default for ChecksumRegistry {
    fn default() -> Self {
        Self::empty()
            .with_algorithm("md5", || Box::new(Md5Hasher(md5::Context::new())))
            .with_algorithm("sha1", || Box::new(DigestHasher(sha1::Sha1::new())))
            .with_algorithm("sha256", || Box::new(DigestHasher(sha2::Sha256::new())))
            .with_algorithm("sha512", || Box::new(DigestHasher(sha2::Sha512::new())))
    }
}

/// Verifies client-declared digests against persisted content.
///
/// Reads the whole object, so it is only run when a client asks for it.
#[derive(Clone)]
pub struct ChecksumVerifier {
    backend: Arc<dyn BlobBackend>,
    keys: UploadKeys,
    registry: ChecksumRegistry,
}

impl ChecksumVerifier {
    pub fn new(backend: Arc<dyn BlobBackend>, keys: UploadKeys, registry: ChecksumRegistry) -> Self {
        Self {
            backend,
            keys,
            registry,
        }
    }

    pub fn registry(&self) -> &ChecksumRegistry {
        &self.registry
    }

    pub fn supported_algorithms(&self) -> Vec<String> {
        self.registry.supported_algorithms()
    }

    /// Hash the persisted content of `id` and compare it with `expected`.
    ///
    /// A mismatch is `Ok(false)`. An unknown algorithm is
    /// `UnsupportedAlgorithm`. A missing upload or malformed id is `NotFound`.
    #[instrument(skip(self, ctx, expected), fields(request_id = %ctx.request_id))]
    pub async fn verify_checksum(
        &self,
        ctx: UploadCtx,
        id: &UploadId,
        algorithm: &str,
        expected: &[u8],
    ) -> UploadResult<bool> {
        let mut hasher = self.registry.hasher(algorithm)?;
        if !UploadKeys::is_valid_id(id) {
            return Err(UploadError::not_found(id.as_str()));
        }
        let object = self.keys.object_key(id);

        ctx.ensure_active()?;
        match self.backend.get_properties(&object).await {
            Ok(_) => {
                ctx.ensure_active()?;
                let mut content = self.backend.download(&object).await?;
                while let Some(bytes) = content.next().await {
                    let bytes = bytes?;
                    ctx.ensure_active()?;
                    hasher.update(&bytes);
                }
            }
            // A hidden upload without a commit has empty content
            Err(UploadError::NotFound { .. }) => {
                ctx.ensure_active()?;
                self.backend.get_properties(&self.keys.pending_key(id)).await?;
            }
            Err(e) => return Err(e),
        }

        let actual = hasher.finalize();
        let matches = actual.len() == expected.len() && actual == expected;
        debug!(
            "{} digest of upload {} is {} (match: {})",
            algorithm,
            id,
            hex::encode(&actual),
            matches
        );
        Ok(matches)
    }
}
