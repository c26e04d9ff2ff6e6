use thiserror::Error;

/// Result type for upload operations
pub type UploadResult<T> = Result<T, UploadError>;

/// Errors that can occur during upload operations
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Object not found: {name}")]
    NotFound { name: String },

    #[error("Object already exists: {name}")]
    AlreadyExists { name: String },

    #[error("Invalid upload state: {message}")]
    InvalidState { message: String },

    #[error("Invalid request: {message}")]
    Invalid { message: String },

    #[error("Checksum algorithm not supported: {algorithm}")]
    UnsupportedAlgorithm { algorithm: String },

    #[error("Operation not supported by this backend: {operation}")]
    Unsupported { operation: &'static str },

    #[error("Operation cancelled")]
    Cancelled,

    /// Timeouts, throttling and other failures a retry policy may absorb
    #[error("Transient backend error: {source}")]
    Transient {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Permission and configuration failures; never retried
    #[error("Fatal backend error: {source}")]
    Fatal {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl UploadError {
    /// Create a not found error
    pub fn not_found<S: Into<String>>(name: S) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Create an already exists error
    pub fn already_exists<S: Into<String>>(name: S) -> Self {
        Self::AlreadyExists { name: name.into() }
    }

    /// Create an invalid state error
    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create an unsupported algorithm error
    pub fn unsupported_algorithm<S: Into<String>>(algorithm: S) -> Self {
        Self::UnsupportedAlgorithm {
            algorithm: algorithm.into(),
        }
    }

    /// Create a transient backend error from any error type
    pub fn transient<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transient {
            source: Box::new(error),
        }
    }

    /// Create a fatal backend error from any error type
    pub fn fatal<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Fatal {
            source: Box::new(error),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether a retry policy wrapping the backend may retry this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
