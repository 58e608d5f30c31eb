//! Deterministic scripted kernel backend.
//!
//! Stands in for the native kernel in tests, development builds, and the
//! default CLI. Token output is either an explicit byte script or a
//! deterministic word sequence derived from the prompt and seed, so the
//! stream/blocking round-trip law holds without a model file.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::api::{
    Backend, Kernel, KernelConfig, KernelContext, KernelError, KernelErrorCode, KernelStream,
    KernelToken, MemoryStats, ModelInfo, SamplingParams, VisionTimings,
};

/// Estimated bytes of KV cache per consumed context token.
const BYTES_PER_CONTEXT_TOKEN: u64 = 512;

/// Fraction of the memory limit at which the pressure callback fires.
const PRESSURE_THRESHOLD: f64 = 0.8;

const WORDLIST: &[&str] = &[
    "the", "quick", "model", "streams", "tokens", "across", "a", "quiet", "channel", "while",
    "budgets", "watch", "thermal", "head", "room", "and", "frames", "queue", "softly", "until",
    "work", "drains", "away", "done",
];

/// Options for the scripted backend.
#[derive(Clone)]
pub struct MockOptions {
    /// Explicit token byte script. When unset, tokens are derived from the
    /// prompt and seed.
    pub script: Option<Vec<Vec<u8>>>,
    /// Per-token confidences, cycled when shorter than the output.
    pub confidences: Option<Vec<f32>>,
    /// Artificial latency per stream token.
    pub token_delay: Duration,
    /// Artificial latency per frame description.
    pub frame_delay: Duration,
    /// Whether the simulated device has a GPU.
    pub gpu_available: bool,
    /// Whether the loaded model carries a multimodal projector.
    pub vision: bool,
    /// Fail `init` with this code.
    pub fail_init: Option<KernelErrorCode>,
    /// Number of words emitted when no script is set and the request does
    /// not cap sooner.
    pub default_output_tokens: u32,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            script: None,
            confidences: None,
            token_delay: Duration::ZERO,
            frame_delay: Duration::ZERO,
            gpu_available: true,
            vision: false,
            fail_init: None,
            default_output_tokens: 32,
        }
    }
}

/// Scripted kernel implementation.
pub struct MockKernel {
    options: MockOptions,
}

impl MockKernel {
    /// Backend with default options: GPU available, no script, no delays.
    pub fn new() -> Self {
        Self {
            options: MockOptions::default(),
        }
    }

    /// Backend with explicit options.
    pub fn with_options(options: MockOptions) -> Self {
        Self { options }
    }

    /// Text-script convenience: each entry becomes one token.
    pub fn scripted<S: AsRef<str>>(tokens: &[S]) -> Self {
        Self::with_options(MockOptions {
            script: Some(tokens.iter().map(|t| t.as_ref().as_bytes().to_vec()).collect()),
            ..MockOptions::default()
        })
    }
}

impl Default for MockKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel for MockKernel {
    fn version(&self) -> String {
        "edgerun-mock 1.0".to_string()
    }

    fn detect_backend(&self) -> Backend {
        if self.options.gpu_available {
            Backend::Gpu
        } else {
            Backend::Cpu
        }
    }

    fn gpu_available(&self) -> bool {
        self.options.gpu_available
    }

    fn init(
        &self,
        config: &KernelConfig,
        model_bytes: &[u8],
        projector_bytes: Option<&[u8]>,
    ) -> Result<Box<dyn KernelContext>, KernelError> {
        if let Some(code) = self.options.fail_init {
            return Err(KernelError::new(code, "scripted init failure"));
        }
        if model_bytes.is_empty() {
            return Err(KernelError::new(
                KernelErrorCode::ModelLoadFailed,
                "model bytes must not be empty",
            ));
        }
        if config.num_threads == 0 {
            return Err(KernelError::new(
                KernelErrorCode::InvalidParameter,
                "num_threads must be >= 1",
            ));
        }
        if config.backend == Backend::Gpu && !self.options.gpu_available {
            return Err(KernelError::new(
                KernelErrorCode::UnsupportedBackend,
                "no GPU backend on this device",
            ));
        }

        let projector_len = projector_bytes.map_or(0, |b| b.len()) as u64;
        let state = Arc::new(Mutex::new(MockState {
            consumed_tokens: 0,
            peak_bytes: model_bytes.len() as u64 + projector_len,
            limit_bytes: config.memory_limit_bytes,
            pressure_cb: None,
            pressure_fired: false,
        }));

        Ok(Box::new(MockContext {
            options: self.options.clone(),
            config: config.clone(),
            model_bytes: model_bytes.len() as u64 + projector_len,
            state,
        }))
    }
}

struct MockState {
    consumed_tokens: u64,
    peak_bytes: u64,
    limit_bytes: u64,
    pressure_cb: Option<Box<dyn Fn(u64, u64) + Send + Sync>>,
    pressure_fired: bool,
}

struct MockContext {
    options: MockOptions,
    config: KernelConfig,
    model_bytes: u64,
    state: Arc<Mutex<MockState>>,
}

fn approx_tokens(text: &str) -> u64 {
    (text.len() as u64 / 4) + 1
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn script_for(options: &MockOptions, prompt: &str, params: &SamplingParams) -> Vec<Vec<u8>> {
    if let Some(script) = &options.script {
        return script.clone();
    }

    let mut state = fnv1a(prompt.as_bytes()) ^ params.seed.unwrap_or(0);
    let count = options.default_output_tokens.min(params.max_tokens.max(1));
    let mut out = Vec::with_capacity(count as usize);
    for i in 0..count {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let word = WORDLIST[(state >> 33) as usize % WORDLIST.len()];
        let sep = if i == 0 { "" } else { " " };
        out.push(format!("{sep}{word}").into_bytes());
    }
    out
}

fn confidence_at(options: &MockOptions, index: usize) -> Option<f32> {
    options
        .confidences
        .as_ref()
        .map(|c| if c.is_empty() { 1.0 } else { c[index % c.len()] })
}

impl MockContext {
    fn current_bytes(&self, state: &MockState) -> u64 {
        self.model_bytes + state.consumed_tokens * BYTES_PER_CONTEXT_TOKEN
    }

    /// Limit check performed at the head of every kernel call.
    fn check_limit(&self) -> Result<(), KernelError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.current_bytes(&state);
        if state.limit_bytes > 0 && current > state.limit_bytes {
            return Err(KernelError::new(
                KernelErrorCode::MemoryLimitExceeded,
                format!(
                    "memory limit exceeded: {current} bytes in use, limit {}",
                    state.limit_bytes
                ),
            ));
        }
        Ok(())
    }

    fn consume(&self, tokens: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.consumed_tokens += tokens;
        let current = self.current_bytes(&state);
        if current > state.peak_bytes {
            state.peak_bytes = current;
        }

        if state.limit_bytes > 0
            && !state.pressure_fired
            && current as f64 >= state.limit_bytes as f64 * PRESSURE_THRESHOLD
        {
            state.pressure_fired = true;
            let (current, limit) = (current, state.limit_bytes);
            if let Some(cb) = &state.pressure_cb {
                cb(current, limit);
            }
        }
    }

    fn admit_prompt(&self, prompt: &str) -> Result<u64, KernelError> {
        let prompt_tokens = approx_tokens(prompt);
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let needed = state.consumed_tokens + prompt_tokens;
        let available = u64::from(self.config.max_context_length);
        if needed > available {
            return Err(KernelError::new(
                KernelErrorCode::InferenceFailed,
                format!("context window exhausted: need {needed} tokens, {available} available"),
            ));
        }
        Ok(prompt_tokens)
    }
}

impl KernelContext for MockContext {
    fn backend(&self) -> Backend {
        self.config.backend
    }

    fn model_info(&self) -> Result<ModelInfo, KernelError> {
        Ok(ModelInfo {
            name: "mock-model".to_string(),
            architecture: "mock".to_string(),
            parameter_count: Some(1_000_000),
            quantization: "q4_0".to_string(),
            trained_context_length: self.config.max_context_length,
            multimodal: self.options.vision,
        })
    }

    fn generate(&mut self, prompt: &str, params: &SamplingParams) -> Result<String, KernelError> {
        self.check_limit()?;
        let prompt_tokens = self.admit_prompt(prompt)?;

        let script = script_for(&self.options, prompt, params);
        let emitted: Vec<&[u8]> = script
            .iter()
            .take(params.max_tokens as usize)
            .map(Vec::as_slice)
            .collect();

        self.consume(prompt_tokens + emitted.len() as u64);

        let bytes: Vec<u8> = emitted.concat();
        String::from_utf8(bytes).map_err(|_| {
            KernelError::new(
                KernelErrorCode::InferenceFailed,
                "script does not form valid UTF-8",
            )
        })
    }

    fn open_stream(
        &mut self,
        prompt: &str,
        params: &SamplingParams,
    ) -> Result<Box<dyn KernelStream + Send>, KernelError> {
        self.check_limit()?;
        let prompt_tokens = self.admit_prompt(prompt)?;
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.consumed_tokens += prompt_tokens;
        }

        Ok(Box::new(MockStream {
            tokens: script_for(&self.options, prompt, params),
            index: 0,
            options: self.options.clone(),
            cancelled: Arc::new(AtomicBool::new(false)),
            shared: SharedAccounting {
                model_bytes: self.model_bytes,
                state: Arc::clone(&self.state),
            },
        }))
    }

    fn describe_frame(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
        prompt: &str,
        params: &SamplingParams,
    ) -> Result<(String, VisionTimings), KernelError> {
        if !self.options.vision {
            return Err(KernelError::new(
                KernelErrorCode::NotImplemented,
                "model has no multimodal projector",
            ));
        }
        let expected = width as usize * height as usize * 3;
        if rgb.len() != expected {
            return Err(KernelError::new(
                KernelErrorCode::InvalidParameter,
                format!("rgb length {} does not match {width}x{height}x3", rgb.len()),
            ));
        }
        self.check_limit()?;
        let prompt_tokens = self.admit_prompt(prompt)?;

        let started = Instant::now();
        if !self.options.frame_delay.is_zero() {
            std::thread::sleep(self.options.frame_delay);
        }

        let frame_tag = fnv1a(rgb) % 1000;
        let body = self.generate(&format!("{prompt} [frame {frame_tag}]"), params)?;
        let description = format!("A {width}x{height} frame: {body}");
        let generated = approx_tokens(&body) as u32;
        self.consume(prompt_tokens);

        let total = started.elapsed().as_millis() as u64;
        Ok((
            description,
            VisionTimings {
                model_load_ms: 0,
                image_encode_ms: total / 2,
                prompt_eval_ms: total / 4,
                decode_ms: total - total / 2 - total / 4,
                prompt_tokens: prompt_tokens as u32,
                generated_tokens: generated,
            },
        ))
    }

    fn memory_stats(&self) -> Result<MemoryStats, KernelError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.current_bytes(&state);
        Ok(MemoryStats {
            current_bytes: current,
            peak_bytes: state.peak_bytes.max(current),
            limit_bytes: state.limit_bytes,
            model_bytes: self.model_bytes,
            context_bytes: state.consumed_tokens * BYTES_PER_CONTEXT_TOKEN,
        })
    }

    fn set_memory_limit(&mut self, bytes: u64) -> Result<(), KernelError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.limit_bytes = bytes;
        state.pressure_fired = false;
        Ok(())
    }

    fn set_memory_pressure_callback(&mut self, cb: Box<dyn Fn(u64, u64) + Send + Sync>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.pressure_cb = Some(cb);
    }

    fn reset_context(&mut self) -> Result<(), KernelError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.consumed_tokens = 0;
        Ok(())
    }
}

struct SharedAccounting {
    model_bytes: u64,
    state: Arc<Mutex<MockState>>,
}

impl SharedAccounting {
    fn consume_one(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.consumed_tokens += 1;
        let current = self.model_bytes + state.consumed_tokens * BYTES_PER_CONTEXT_TOKEN;
        if current > state.peak_bytes {
            state.peak_bytes = current;
        }
        if state.limit_bytes > 0
            && !state.pressure_fired
            && current as f64 >= state.limit_bytes as f64 * PRESSURE_THRESHOLD
        {
            state.pressure_fired = true;
            if let Some(cb) = &state.pressure_cb {
                cb(current, state.limit_bytes);
            }
        }
    }
}

struct MockStream {
    tokens: Vec<Vec<u8>>,
    index: usize,
    options: MockOptions,
    cancelled: Arc<AtomicBool>,
    shared: SharedAccounting,
}

impl KernelStream for MockStream {
    fn next_token(&mut self) -> Result<Option<KernelToken>, KernelError> {
        if self.cancelled.load(Ordering::SeqCst) || self.index >= self.tokens.len() {
            return Ok(None);
        }

        if !self.options.token_delay.is_zero() {
            std::thread::sleep(self.options.token_delay);
        }

        let bytes = self.tokens[self.index].clone();
        let confidence = confidence_at(&self.options, self.index);
        self.index += 1;
        self.shared.consume_one();

        Ok(Some(KernelToken { bytes, confidence }))
    }

    fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(kernel: &MockKernel) -> Box<dyn KernelContext> {
        kernel
            .init(&KernelConfig::default(), b"weights", None)
            .expect("init")
    }

    #[test]
    fn generate_is_deterministic_for_fixed_seed() {
        let kernel = MockKernel::new();
        let params = SamplingParams {
            seed: Some(7),
            temperature: 0.0,
            ..SamplingParams::default()
        };

        let a = context(&kernel).generate("hello", &params).expect("generate");
        let b = context(&kernel).generate("hello", &params).expect("generate");
        assert_eq!(a, b);

        let other_seed = SamplingParams {
            seed: Some(8),
            ..params
        };
        let c = context(&kernel).generate("hello", &other_seed).expect("generate");
        assert_ne!(a, c);
    }

    #[test]
    fn stream_concat_matches_blocking_generate() {
        let kernel = MockKernel::new();
        let params = SamplingParams {
            seed: Some(42),
            max_tokens: 10,
            ..SamplingParams::default()
        };

        let blocking = context(&kernel).generate("prompt", &params).expect("generate");

        let mut ctx = context(&kernel);
        let mut stream = ctx.open_stream("prompt", &params).expect("stream");
        let mut bytes = Vec::new();
        let mut count = 0u32;
        while count < params.max_tokens {
            match stream.next_token().expect("token") {
                Some(token) => {
                    bytes.extend_from_slice(&token.bytes);
                    count += 1;
                }
                None => break,
            }
        }
        assert_eq!(String::from_utf8(bytes).expect("utf8"), blocking);
    }

    #[test]
    fn context_overflow_reports_inference_failure() {
        let kernel = MockKernel::new();
        let config = KernelConfig {
            max_context_length: 8,
            ..KernelConfig::default()
        };
        let mut ctx = kernel.init(&config, b"weights", None).expect("init");

        let long_prompt = "x".repeat(200);
        let err = ctx
            .generate(&long_prompt, &SamplingParams::default())
            .expect_err("must overflow");
        assert_eq!(err.code, KernelErrorCode::InferenceFailed);
        assert!(err.message.contains("context window"));

        ctx.reset_context().expect("reset");
        ctx.generate("hi", &SamplingParams::default()).expect("fits after reset");
    }

    #[test]
    fn memory_limit_below_usage_fails_next_call() {
        let kernel = MockKernel::new();
        let mut ctx = context(&kernel);
        ctx.generate("warm up the cache", &SamplingParams::default()).expect("generate");

        ctx.set_memory_limit(1).expect("set limit");
        let err = ctx
            .generate("another", &SamplingParams::default())
            .expect_err("limit exceeded");
        assert_eq!(err.code, KernelErrorCode::MemoryLimitExceeded);
    }

    #[test]
    fn pressure_callback_fires_once_per_limit() {
        let kernel = MockKernel::new();
        let mut ctx = context(&kernel);

        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = Arc::clone(&fired);
        ctx.set_memory_pressure_callback(Box::new(move |current, limit| {
            assert!(current as f64 >= limit as f64 * PRESSURE_THRESHOLD);
            fired_clone.store(true, Ordering::SeqCst);
        }));

        // Limit slightly above current usage so a little generation crosses
        // the 80% threshold.
        let usage = ctx.memory_stats().expect("stats").current_bytes;
        ctx.set_memory_limit(usage + 4 * BYTES_PER_CONTEXT_TOKEN).expect("set limit");

        ctx.generate("push usage up", &SamplingParams::default()).ok();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn explicit_gpu_fails_without_gpu() {
        let kernel = MockKernel::with_options(MockOptions {
            gpu_available: false,
            ..MockOptions::default()
        });
        let config = KernelConfig {
            backend: Backend::Gpu,
            ..KernelConfig::default()
        };
        let Err(err) = kernel.init(&config, b"weights", None) else {
            panic!("init must fail without a GPU");
        };
        assert_eq!(err.code, KernelErrorCode::UnsupportedBackend);
    }

    #[test]
    fn describe_frame_requires_vision_and_matching_dimensions() {
        let text_only = MockKernel::new();
        let mut ctx = context(&text_only);
        let err = ctx
            .describe_frame(&[0; 12], 2, 2, "what is this", &SamplingParams::default())
            .expect_err("text-only");
        assert_eq!(err.code, KernelErrorCode::NotImplemented);

        let vision = MockKernel::with_options(MockOptions {
            vision: true,
            ..MockOptions::default()
        });
        let mut ctx = vision
            .init(&KernelConfig::default(), b"weights", Some(b"proj"))
            .expect("init");

        let err = ctx
            .describe_frame(&[0; 11], 2, 2, "bad len", &SamplingParams::default())
            .expect_err("bad rgb length");
        assert_eq!(err.code, KernelErrorCode::InvalidParameter);

        let (description, timings) = ctx
            .describe_frame(&[7; 12], 2, 2, "describe", &SamplingParams::default())
            .expect("describe");
        assert!(description.starts_with("A 2x2 frame:"));
        assert!(timings.prompt_tokens > 0);
    }

    #[test]
    fn cancelled_stream_stops_yielding() {
        let kernel = MockKernel::scripted(&["a", "b", "c"]);
        let mut ctx = context(&kernel);
        let mut stream = ctx
            .open_stream("p", &SamplingParams::default())
            .expect("stream");

        assert!(stream.next_token().expect("token").is_some());
        stream.cancel();
        assert!(stream.next_token().expect("token").is_none());
    }
}
