//! Typed error surface.
//!
//! Every layer boundary wraps the layer below into an [`EngineError`]: the
//! prior error's rendering lands in `details`, never a bare propagated
//! exception. The kind set is closed and one-to-one with the kernel's error
//! classes plus the host-only kinds.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use edgerun_kernel::{KernelError, KernelErrorCode};

/// Closed set of error kinds crossing the public surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The supplied configuration or request is invalid.
    InvalidConfig,
    /// No model with the requested id exists in the registry or cache.
    ModelNotFound,
    /// The kernel could not load the model bytes.
    ModelLoadFailed,
    /// The kernel ran out of memory or exceeded its configured limit.
    OutOfMemory,
    /// The prompt (plus accumulated context) no longer fits the context
    /// window. Recoverable by resetting the context.
    ContextOverflow,
    /// Token generation failed for a reason other than the above.
    GenerationFailed,
    /// The operation was cancelled by the caller.
    Cancelled,
    /// The requested compute backend is not available on this device.
    UnsupportedBackend,
    /// Downloaded bytes did not match the declared SHA-256.
    ChecksumMismatch,
    /// A network fault persisted through all retries.
    NetworkTransient,
    /// The server answered with a non-success HTTP status.
    Http,
    /// The cache could not persist the entry.
    CacheWriteFailed,
    /// No response arrived within the protocol timeout.
    TimedOut,
    /// The runtime was disposed while the request was pending.
    Disposed,
    /// Another kernel-accessing request is already in flight.
    Busy,
}

/// An error with a kind, a message, an optional remediation hint, and the
/// rendering of the error it wraps.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct EngineError {
    /// Which class of failure this is. Serialized as `code` on the wire.
    #[serde(rename = "code")]
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// What the caller can do about it, when anything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// Rendering of the wrapped lower-layer error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl EngineError {
    /// Build an error with no hint or details.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            hint: None,
            details: None,
        }
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attach the rendering of the error this one wraps.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Shorthand for a cancellation error.
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation cancelled")
    }
}

impl From<KernelError> for EngineError {
    fn from(err: KernelError) -> Self {
        let kind = match err.code {
            KernelErrorCode::InvalidParameter => ErrorKind::InvalidConfig,
            KernelErrorCode::OutOfMemory | KernelErrorCode::MemoryLimitExceeded => {
                ErrorKind::OutOfMemory
            }
            KernelErrorCode::ModelLoadFailed => ErrorKind::ModelLoadFailed,
            KernelErrorCode::BackendInitFailed | KernelErrorCode::UnsupportedBackend => {
                ErrorKind::UnsupportedBackend
            }
            KernelErrorCode::Ok
            | KernelErrorCode::InferenceFailed
            | KernelErrorCode::ContextInvalid
            | KernelErrorCode::StreamEnded
            | KernelErrorCode::NotImplemented => ErrorKind::GenerationFailed,
        };

        let mut out = EngineError::new(kind, err.message.clone()).with_details(err.to_string());
        if let Some(hint) = err.hint {
            out = out.with_hint(hint);
        } else if kind == ErrorKind::OutOfMemory {
            out = out.with_hint("reset the context or load a smaller model");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_errors_translate_to_host_kinds() {
        let err: EngineError =
            KernelError::new(KernelErrorCode::OutOfMemory, "allocation failed").into();
        assert_eq!(err.kind, ErrorKind::OutOfMemory);
        assert!(err.hint.is_some());
        assert!(err.details.is_some());

        let err: EngineError =
            KernelError::new(KernelErrorCode::UnsupportedBackend, "no gpu").into();
        assert_eq!(err.kind, ErrorKind::UnsupportedBackend);
    }

    #[test]
    fn wire_round_trip_preserves_kind_and_hint() {
        let err = EngineError::new(ErrorKind::ContextOverflow, "prompt too long")
            .with_hint("resetContext");
        let json = serde_json::to_string(&err).expect("serialize");
        let back: EngineError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.kind, ErrorKind::ContextOverflow);
        assert_eq!(back.hint.as_deref(), Some("resetContext"));
    }
}
