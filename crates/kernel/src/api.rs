//! Traits, data types, and error translation for the edge inference kernel.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of status codes returned by the kernel C ABI.
///
/// `StreamEnded` is not a failure: it signals end-of-stream and is translated
/// into `Ok(None)` by [`KernelStream::next_token`] rather than into an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum KernelErrorCode {
    /// Call completed.
    Ok = 0,
    /// A parameter failed kernel-side validation.
    InvalidParameter = 1,
    /// The kernel could not allocate memory.
    OutOfMemory = 2,
    /// Model bytes could not be loaded.
    ModelLoadFailed = 3,
    /// The compute backend failed to initialize.
    BackendInitFailed = 4,
    /// Token generation failed.
    InferenceFailed = 5,
    /// The context handle is no longer valid.
    ContextInvalid = 6,
    /// The stream has produced its last token.
    StreamEnded = 7,
    /// The kernel does not implement the requested operation.
    NotImplemented = 8,
    /// The configured memory limit was exceeded.
    MemoryLimitExceeded = 9,
    /// The requested compute backend is not available on this device.
    UnsupportedBackend = 10,
}

impl KernelErrorCode {
    /// Translate a raw ABI status value. Unknown values map to
    /// `InferenceFailed` so a kernel newer than this adapter degrades to a
    /// generic failure instead of UB.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => Self::Ok,
            1 => Self::InvalidParameter,
            2 => Self::OutOfMemory,
            3 => Self::ModelLoadFailed,
            4 => Self::BackendInitFailed,
            6 => Self::ContextInvalid,
            7 => Self::StreamEnded,
            8 => Self::NotImplemented,
            9 => Self::MemoryLimitExceeded,
            10 => Self::UnsupportedBackend,
            _ => Self::InferenceFailed,
        }
    }
}

/// A kernel failure carrying the translated code, the kernel's message, and a
/// remediation hint where one exists.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("kernel error ({code:?}): {message}")]
pub struct KernelError {
    /// Translated status code.
    pub code: KernelErrorCode,
    /// Message reported by the kernel (or synthesized by the adapter).
    pub message: String,
    /// What the caller can do about it, when anything.
    pub hint: Option<String>,
}

impl KernelError {
    /// Build an error with no remediation hint.
    pub fn new(code: KernelErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            hint: None,
        }
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// Compute backend selected (or detected) by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backend {
    /// GPU execution.
    Gpu,
    /// CPU execution.
    Cpu,
}

impl Backend {
    /// Human-readable backend name, matching what the kernel reports.
    pub fn name(self) -> &'static str {
        match self {
            Backend::Gpu => "GPU",
            Backend::Cpu => "CPU",
        }
    }
}

/// Configuration handed to [`Kernel::init`]. Frozen for the lifetime of the
/// resulting context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Compute backend to initialize. The kernel fails with
    /// `UnsupportedBackend` when the device cannot provide it; backend
    /// selection policy (auto fallback) lives above the adapter.
    pub backend: Backend,
    /// Maximum context length in tokens.
    pub max_context_length: u32,
    /// Number of compute threads (>= 1).
    pub num_threads: u32,
    /// Initial memory limit in bytes; 0 means no limit.
    pub memory_limit_bytes: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Cpu,
            max_context_length: 2048,
            num_threads: 4,
            memory_limit_bytes: 0,
        }
    }
}

/// Sampling parameters passed through to the kernel per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Maximum number of tokens to generate.
    pub max_tokens: u32,
    /// Sampling temperature in `[0, 2]`; 0 is deterministic for a fixed seed.
    pub temperature: f32,
    /// Nucleus sampling mass in `(0, 1]`.
    pub top_p: f32,
    /// Top-k cutoff (>= 1).
    pub top_k: u32,
    /// Repetition penalty (>= 1).
    pub repetition_penalty: f32,
    /// Sampler seed; `None` lets the kernel pick.
    pub seed: Option<u64>,
    /// Constrain output to JSON.
    pub json_mode: bool,
    /// GBNF grammar source, when grammar-constrained.
    pub grammar: Option<String>,
    /// Grammar root rule name.
    pub grammar_root: Option<String>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_tokens: 100,
            temperature: 0.7,
            top_p: 0.95,
            top_k: 40,
            repetition_penalty: 1.1,
            seed: None,
            json_mode: false,
            grammar: None,
            grammar_root: None,
        }
    }
}

/// Memory accounting reported by the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Bytes currently allocated.
    pub current_bytes: u64,
    /// High-water mark for this context. Monotonic within a session.
    pub peak_bytes: u64,
    /// Configured limit; 0 means no limit.
    pub limit_bytes: u64,
    /// Bytes held by model weights.
    pub model_bytes: u64,
    /// Bytes held by the KV cache and scratch buffers.
    pub context_bytes: u64,
}

impl MemoryStats {
    /// Usage as a fraction of the limit; 0 when no limit is set.
    pub fn usage_percent(&self) -> f64 {
        if self.limit_bytes == 0 {
            return 0.0;
        }
        self.current_bytes as f64 / self.limit_bytes as f64
    }

    /// True at or above 80% of the limit.
    pub fn is_high_pressure(&self) -> bool {
        self.limit_bytes > 0 && self.usage_percent() >= 0.8
    }

    /// True at or above 90% of the limit.
    pub fn is_critical(&self) -> bool {
        self.limit_bytes > 0 && self.usage_percent() >= 0.9
    }
}

/// Model metadata reported by a loaded context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model name as embedded in the weights.
    pub name: String,
    /// Architecture tag (e.g. "llama").
    pub architecture: String,
    /// Declared parameter count, when known.
    pub parameter_count: Option<u64>,
    /// Quantization tag (e.g. "q4_k_m").
    pub quantization: String,
    /// Context length the model was trained for.
    pub trained_context_length: u32,
    /// Whether a multimodal projector is loaded alongside the model.
    pub multimodal: bool,
}

/// One token produced by a stream.
///
/// Payloads are raw bytes: a token may end mid UTF-8 code point, and the
/// worker above the adapter owns reassembly into text.
#[derive(Debug, Clone)]
pub struct KernelToken {
    /// Raw token bytes.
    pub bytes: Vec<u8>,
    /// Logit-derived confidence in `[0, 1]`, when the kernel exposes it.
    pub confidence: Option<f32>,
}

/// Timing breakdown for one frame description.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct VisionTimings {
    /// Time loading/preparing the model portion of the call, in ms.
    pub model_load_ms: u64,
    /// Time encoding the image into embeddings, in ms.
    pub image_encode_ms: u64,
    /// Time evaluating the prompt, in ms.
    pub prompt_eval_ms: u64,
    /// Time decoding output tokens, in ms.
    pub decode_ms: u64,
    /// Number of prompt tokens evaluated.
    pub prompt_tokens: u32,
    /// Number of tokens generated.
    pub generated_tokens: u32,
}

/// Entry point to a kernel implementation.
pub trait Kernel: Send + Sync {
    /// Kernel version string.
    fn version(&self) -> String;

    /// Detect the best backend available on this device.
    fn detect_backend(&self) -> Backend;

    /// Whether the device can provide a GPU backend at all.
    fn gpu_available(&self) -> bool;

    /// Load a model (and optional multimodal projector) into a new context.
    ///
    /// Model bytes are copied into kernel-owned buffers before this returns;
    /// the caller keeps ownership of the slices.
    fn init(
        &self,
        config: &KernelConfig,
        model_bytes: &[u8],
        projector_bytes: Option<&[u8]>,
    ) -> Result<Box<dyn KernelContext>, KernelError>;
}

/// A loaded model. Exclusively owned by one worker for its lifetime; dropping
/// the context frees the kernel handle.
pub trait KernelContext: Send {
    /// Backend the context actually initialized on.
    fn backend(&self) -> Backend;

    /// Model metadata.
    fn model_info(&self) -> Result<ModelInfo, KernelError>;

    /// Generate to completion in one blocking call.
    fn generate(&mut self, prompt: &str, params: &SamplingParams) -> Result<String, KernelError>;

    /// Open a token stream for the prompt.
    ///
    /// The returned stream is independent of the context borrow so that
    /// non-generating calls (memory stats, model info) stay available while
    /// tokens are being pulled; the context must not start another
    /// generation until the stream is dropped.
    fn open_stream(
        &mut self,
        prompt: &str,
        params: &SamplingParams,
    ) -> Result<Box<dyn KernelStream + Send>, KernelError>;

    /// Describe an RGB frame. Text-only kernels answer `NotImplemented`.
    fn describe_frame(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
        prompt: &str,
        params: &SamplingParams,
    ) -> Result<(String, VisionTimings), KernelError>;

    /// Current memory accounting.
    fn memory_stats(&self) -> Result<MemoryStats, KernelError>;

    /// Set the memory limit in bytes; 0 clears it. A limit below current
    /// usage makes the next kernel call fail with `MemoryLimitExceeded`.
    fn set_memory_limit(&mut self, bytes: u64) -> Result<(), KernelError>;

    /// Install a callback fired when usage crosses the pressure threshold.
    fn set_memory_pressure_callback(&mut self, cb: Box<dyn Fn(u64, u64) + Send + Sync>);

    /// Clear the KV cache, recovering context space.
    fn reset_context(&mut self) -> Result<(), KernelError>;
}

/// An open token stream. Dropping the stream frees the kernel-side handle.
pub trait KernelStream {
    /// Pull the next token. `Ok(None)` means the stream ended
    /// (`StreamEnded` at the ABI level).
    fn next_token(&mut self) -> Result<Option<KernelToken>, KernelError>;

    /// Ask the kernel to stop generating. The flag is polled in the generate
    /// loop, so one more token may still be produced.
    fn cancel(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_translation_round_trips_known_values() {
        for raw in 0..=10 {
            let code = KernelErrorCode::from_raw(raw);
            if raw != 5 {
                assert_eq!(code as i32, raw);
            }
        }
        assert_eq!(KernelErrorCode::from_raw(999), KernelErrorCode::InferenceFailed);
        assert_eq!(KernelErrorCode::from_raw(-1), KernelErrorCode::InferenceFailed);
    }

    #[test]
    fn memory_stats_pressure_flags() {
        let stats = MemoryStats {
            current_bytes: 850,
            peak_bytes: 900,
            limit_bytes: 1000,
            model_bytes: 800,
            context_bytes: 50,
        };
        assert!(stats.is_high_pressure());
        assert!(!stats.is_critical());

        let critical = MemoryStats {
            current_bytes: 950,
            ..stats
        };
        assert!(critical.is_critical());

        let unlimited = MemoryStats {
            limit_bytes: 0,
            ..stats
        };
        assert!(!unlimited.is_high_pressure());
        assert_eq!(unlimited.usage_percent(), 0.0);
    }
}
