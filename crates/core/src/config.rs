//! Engine configuration. Frozen at init; never mutated afterwards.

use serde::{Deserialize, Serialize};

use edgerun_kernel::{Backend, KernelConfig};

use crate::error::{EngineError, ErrorKind};

/// Which compute backend to initialize.
///
/// `Gpu` fails loud when no GPU backend exists; only `Auto` falls back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceHint {
    /// Require GPU execution.
    Gpu,
    /// Require CPU execution.
    Cpu,
    /// Prefer GPU, fall back to CPU.
    #[default]
    Auto,
}

/// Configuration for one runtime instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Id of the model to load.
    pub model_id: String,
    /// Compute backend selection.
    #[serde(default)]
    pub device: DeviceHint,
    /// Precision tag recorded in cache metadata (e.g. "q4_k_m").
    #[serde(default = "EngineConfig::default_precision")]
    pub precision: String,
    /// Maximum context length in tokens.
    #[serde(default = "EngineConfig::default_max_context_length")]
    pub max_context_length: u32,
    /// Number of kernel compute threads (>= 1).
    #[serde(default = "EngineConfig::default_num_threads")]
    pub num_threads: u32,
    /// Whether model bytes are cached on disk.
    #[serde(default = "EngineConfig::default_cache_enabled")]
    pub cache_enabled: bool,
    /// Cache namespace, isolating this runtime's entries.
    #[serde(default = "EngineConfig::default_cache_namespace")]
    pub cache_namespace: String,
    /// Kernel memory limit in bytes; 0 means no limit.
    #[serde(default)]
    pub memory_limit_bytes: u64,
}

impl EngineConfig {
    /// Default context length in tokens.
    pub const DEFAULT_MAX_CONTEXT_LENGTH: u32 = 2048;

    /// Default kernel thread count.
    pub const DEFAULT_NUM_THREADS: u32 = 4;

    /// Default cache namespace.
    pub const DEFAULT_CACHE_NAMESPACE: &'static str = "default";

    fn default_precision() -> String {
        "q4_k_m".to_string()
    }

    fn default_max_context_length() -> u32 {
        Self::DEFAULT_MAX_CONTEXT_LENGTH
    }

    fn default_num_threads() -> u32 {
        Self::DEFAULT_NUM_THREADS
    }

    fn default_cache_enabled() -> bool {
        true
    }

    fn default_cache_namespace() -> String {
        Self::DEFAULT_CACHE_NAMESPACE.to_string()
    }

    /// Configuration for `model_id` with every other field at its default.
    pub fn for_model(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            device: DeviceHint::Auto,
            precision: Self::default_precision(),
            max_context_length: Self::DEFAULT_MAX_CONTEXT_LENGTH,
            num_threads: Self::DEFAULT_NUM_THREADS,
            cache_enabled: true,
            cache_namespace: Self::DEFAULT_CACHE_NAMESPACE.to_string(),
            memory_limit_bytes: 0,
        }
    }

    /// Reject configurations the kernel would refuse anyway, with a better
    /// message and before any bytes are loaded.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.model_id.trim().is_empty() {
            return Err(EngineError::new(
                ErrorKind::InvalidConfig,
                "model_id must not be empty",
            ));
        }
        if self.max_context_length == 0 {
            return Err(EngineError::new(
                ErrorKind::InvalidConfig,
                "max_context_length must be >= 1",
            ));
        }
        if self.num_threads == 0 {
            return Err(EngineError::new(
                ErrorKind::InvalidConfig,
                "num_threads must be >= 1",
            ));
        }
        if self.cache_namespace.trim().is_empty()
            || self.cache_namespace.contains(['/', '\\', '\0'])
        {
            return Err(EngineError::new(
                ErrorKind::InvalidConfig,
                "cache_namespace must be a plain directory name",
            ));
        }
        Ok(())
    }

    /// Kernel-level configuration for a resolved backend.
    pub fn kernel_config(&self, backend: Backend) -> KernelConfig {
        KernelConfig {
            backend,
            max_context_length: self.max_context_length,
            num_threads: self.num_threads,
            memory_limit_bytes: self.memory_limit_bytes,
        }
    }
}
