//! Store-layer failure taxonomy.

use edgerun_core::{EngineError, ErrorKind};

/// Failures raised by the cache and the downloader.
///
/// `Cancelled` is always distinguishable from `NetworkTransient`: a cancelled
/// read never reports as a network fault, even when the abort surfaces as an
/// I/O error underneath.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The caller cancelled the operation.
    #[error("download cancelled")]
    Cancelled,

    /// A network fault persisted through every retry.
    #[error("network error after {attempts} attempt(s): {source}")]
    NetworkTransient {
        /// Attempts made before giving up.
        attempts: u32,
        /// The final transport error.
        #[source]
        source: reqwest::Error,
    },

    /// The server answered with a non-success status. Not retryable.
    #[error("http status {status} fetching {url}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Request URL.
        url: String,
    },

    /// Downloaded bytes did not match the declared SHA-256.
    #[error("checksum mismatch for {id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Model id.
        id: String,
        /// Declared digest.
        expected: String,
        /// Computed digest.
        actual: String,
    },

    /// The cache could not read or persist an entry.
    #[error("cache i/o failed: {0}")]
    CacheWrite(#[from] std::io::Error),

    /// Cache metadata was unreadable.
    #[error("cache metadata corrupt: {0}")]
    MetaCorrupt(#[from] serde_json::Error),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        let kind = match &err {
            StoreError::Cancelled => ErrorKind::Cancelled,
            StoreError::NetworkTransient { .. } => ErrorKind::NetworkTransient,
            StoreError::Http { .. } => ErrorKind::Http,
            StoreError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            StoreError::CacheWrite(_) | StoreError::MetaCorrupt(_) => ErrorKind::CacheWriteFailed,
        };
        let message = err.to_string();
        let mut out = EngineError::new(kind, message.clone()).with_details(message);
        if kind == ErrorKind::ChecksumMismatch {
            out = out.with_hint("delete the cached entry and re-download");
        }
        out
    }
}
