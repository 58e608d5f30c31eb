//! FFI-backed kernel implementation.
//!
//! Memory contract: inputs are passed as pointer + length and copied by the
//! kernel before any call returns; outputs are copied into Rust-owned buffers
//! immediately and the kernel allocation freed. No kernel pointer escapes
//! this module.

use std::ffi::{CStr, CString, c_char, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;

use crate::api::{
    Backend, Kernel, KernelConfig, KernelContext, KernelError, KernelErrorCode, KernelStream,
    KernelToken, MemoryStats, ModelInfo, SamplingParams, VisionTimings,
};
use crate::ffi;

/// Kernel implementation linked against `libedgekernel`.
pub struct NativeKernel;

struct PressureCtx {
    cb: Box<dyn Fn(u64, u64) + Send + Sync>,
}

unsafe extern "C" fn pressure_trampoline(current: u64, limit: u64, user_data: *mut c_void) {
    let ctx = unsafe { &*(user_data as *const PressureCtx) };
    let _ = catch_unwind(AssertUnwindSafe(|| (ctx.cb)(current, limit)));
}

/// Copy a borrowed kernel C string. Does not free the pointer.
fn read_static_str(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    // SAFETY: the kernel returns NUL-terminated strings with static or
    // handle-scoped lifetime; we copy before returning.
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

/// Copy an owned kernel C string and free it via `ek_free_string`.
fn take_string(ptr: *mut c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    // SAFETY: ownership of `ptr` transfers to us; we copy the bytes out and
    // free exactly once.
    let out = unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned();
    unsafe { ffi::ek_free_string(ptr) };
    out
}

fn code_error(code: KernelErrorCode, handle: *mut c_void) -> KernelError {
    let message = if handle.is_null() {
        // SAFETY: ek_error_string returns a static description for any code.
        read_static_str(unsafe { ffi::ek_error_string(code as i32) })
    } else {
        // SAFETY: handle is a live kernel handle owned by the caller.
        let detail = read_static_str(unsafe { ffi::ek_get_last_error(handle) });
        if detail.is_empty() {
            read_static_str(unsafe { ffi::ek_error_string(code as i32) })
        } else {
            detail
        }
    };
    KernelError::new(code, message)
}

fn backend_from_raw(raw: i32) -> Backend {
    if raw == 0 { Backend::Gpu } else { Backend::Cpu }
}

struct OwnedSamplingParams {
    raw: ffi::EkSamplingParams,
    _grammar: Option<CString>,
    _grammar_root: Option<CString>,
}

fn build_params(params: &SamplingParams) -> Result<OwnedSamplingParams, KernelError> {
    let grammar = params
        .grammar
        .as_deref()
        .map(CString::new)
        .transpose()
        .map_err(|_| {
            KernelError::new(
                KernelErrorCode::InvalidParameter,
                "grammar contains an interior NUL byte",
            )
        })?;
    let grammar_root = params
        .grammar_root
        .as_deref()
        .map(CString::new)
        .transpose()
        .map_err(|_| {
            KernelError::new(
                KernelErrorCode::InvalidParameter,
                "grammar root contains an interior NUL byte",
            )
        })?;

    let raw = ffi::EkSamplingParams {
        max_tokens: params.max_tokens,
        temperature: params.temperature,
        top_p: params.top_p,
        top_k: params.top_k,
        repetition_penalty: params.repetition_penalty,
        seed: params.seed.unwrap_or(0),
        has_seed: params.seed.is_some(),
        json_mode: params.json_mode,
        grammar: grammar.as_deref().map_or(ptr::null(), |s| s.as_ptr()),
        grammar_root: grammar_root.as_deref().map_or(ptr::null(), |s| s.as_ptr()),
    };

    Ok(OwnedSamplingParams {
        raw,
        _grammar: grammar,
        _grammar_root: grammar_root,
    })
}

impl Kernel for NativeKernel {
    fn version(&self) -> String {
        // SAFETY: no arguments; returns a static string.
        read_static_str(unsafe { ffi::ek_version() })
    }

    fn detect_backend(&self) -> Backend {
        // SAFETY: no arguments.
        backend_from_raw(unsafe { ffi::ek_detect_backend() })
    }

    fn gpu_available(&self) -> bool {
        // SAFETY: no arguments.
        unsafe { ffi::ek_gpu_available() }
    }

    fn init(
        &self,
        config: &KernelConfig,
        model_bytes: &[u8],
        projector_bytes: Option<&[u8]>,
    ) -> Result<Box<dyn KernelContext>, KernelError> {
        if model_bytes.is_empty() {
            return Err(KernelError::new(
                KernelErrorCode::InvalidParameter,
                "model bytes must not be empty",
            ));
        }
        if config.num_threads == 0 {
            return Err(KernelError::new(
                KernelErrorCode::InvalidParameter,
                "num_threads must be >= 1",
            ));
        }

        let mut raw = std::mem::MaybeUninit::<ffi::EkConfig>::uninit();
        // SAFETY: ek_config_default fully initializes the struct.
        unsafe { ffi::ek_config_default(raw.as_mut_ptr()) };
        let mut raw = unsafe { raw.assume_init() };

        raw.backend = match config.backend {
            Backend::Gpu => 0,
            Backend::Cpu => 1,
        };
        raw.max_context_length = config.max_context_length;
        raw.num_threads = config.num_threads;
        raw.memory_limit_bytes = config.memory_limit_bytes;
        raw.model_data = model_bytes.as_ptr();
        raw.model_len = model_bytes.len();
        raw.projector_data = projector_bytes.map_or(ptr::null(), |b| b.as_ptr());
        raw.projector_len = projector_bytes.map_or(0, |b| b.len());

        let mut err: i32 = 0;
        // SAFETY: `raw` and all buffers it references outlive this call; the
        // kernel copies model bytes before returning.
        let handle = unsafe { ffi::ek_init(&raw, &mut err) };
        if handle.is_null() {
            let code = match KernelErrorCode::from_raw(err) {
                KernelErrorCode::Ok => KernelErrorCode::ModelLoadFailed,
                code => code,
            };
            return Err(code_error(code, ptr::null_mut()));
        }

        Ok(Box::new(NativeContext {
            handle,
            backend: config.backend,
            _pressure: None,
        }))
    }
}

struct NativeContext {
    handle: *mut c_void,
    backend: Backend,
    // Kept alive for as long as the kernel may invoke the callback.
    _pressure: Option<Box<PressureCtx>>,
}

// SAFETY: the handle is exclusively owned by this context, which the runtime
// confines to a single worker thread; the kernel requires no thread affinity.
unsafe impl Send for NativeContext {}

impl Drop for NativeContext {
    fn drop(&mut self) {
        // SAFETY: handle was returned by ek_init and is freed exactly once.
        unsafe {
            ffi::ek_set_memory_pressure_callback(self.handle, None, ptr::null_mut());
            ffi::ek_free(self.handle);
        }
    }
}

impl NativeContext {
    fn check(&self, status: i32) -> Result<(), KernelError> {
        match KernelErrorCode::from_raw(status) {
            KernelErrorCode::Ok => Ok(()),
            code => Err(code_error(code, self.handle)),
        }
    }
}

impl KernelContext for NativeContext {
    fn backend(&self) -> Backend {
        self.backend
    }

    fn model_info(&self) -> Result<ModelInfo, KernelError> {
        let mut name: *mut c_char = ptr::null_mut();
        let mut architecture: *mut c_char = ptr::null_mut();
        let mut parameter_count: u64 = 0;
        let mut quantization: *mut c_char = ptr::null_mut();
        let mut trained_context_length: u32 = 0;
        let mut multimodal = false;

        // SAFETY: all out-pointers reference initialized locals; string
        // out-params transfer ownership and are freed by take_string.
        let status = unsafe {
            ffi::ek_get_model_info(
                self.handle,
                &mut name,
                &mut architecture,
                &mut parameter_count,
                &mut quantization,
                &mut trained_context_length,
                &mut multimodal,
            )
        };
        self.check(status)?;

        Ok(ModelInfo {
            name: take_string(name),
            architecture: take_string(architecture),
            parameter_count: (parameter_count > 0).then_some(parameter_count),
            quantization: take_string(quantization),
            trained_context_length,
            multimodal,
        })
    }

    fn generate(&mut self, prompt: &str, params: &SamplingParams) -> Result<String, KernelError> {
        let owned = build_params(params)?;
        // SAFETY: prompt and params outlive the call; the result string is
        // copied out and freed by take_string.
        let result = unsafe {
            ffi::ek_generate(self.handle, prompt.as_ptr(), prompt.len(), &owned.raw)
        };
        match KernelErrorCode::from_raw(result.err) {
            KernelErrorCode::Ok => Ok(take_string(result.text)),
            code => {
                take_string(result.text);
                Err(code_error(code, self.handle))
            }
        }
    }

    fn open_stream(
        &mut self,
        prompt: &str,
        params: &SamplingParams,
    ) -> Result<Box<dyn KernelStream + Send>, KernelError> {
        let owned = build_params(params)?;
        let mut err: i32 = 0;
        // SAFETY: prompt and params outlive the call.
        let stream = unsafe {
            ffi::ek_generate_stream(self.handle, prompt.as_ptr(), prompt.len(), &owned.raw, &mut err)
        };
        if stream.is_null() {
            return Err(code_error(KernelErrorCode::from_raw(err), self.handle));
        }
        Ok(Box::new(NativeStream {
            stream,
            ctx_handle: self.handle,
            ended: false,
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
        let expected = width as usize * height as usize * 3;
        if rgb.len() != expected {
            return Err(KernelError::new(
                KernelErrorCode::InvalidParameter,
                format!("rgb length {} does not match {width}x{height}x3", rgb.len()),
            ));
        }

        let owned = build_params(params)?;
        // SAFETY: all buffers outlive the call; the kernel copies the frame
        // before evaluating it.
        let result = unsafe {
            ffi::ek_describe_frame(
                self.handle,
                rgb.as_ptr(),
                rgb.len(),
                width,
                height,
                prompt.as_ptr(),
                prompt.len(),
                &owned.raw,
            )
        };
        match KernelErrorCode::from_raw(result.err) {
            KernelErrorCode::Ok => Ok((
                take_string(result.text),
                VisionTimings {
                    model_load_ms: result.model_load_ms,
                    image_encode_ms: result.image_encode_ms,
                    prompt_eval_ms: result.prompt_eval_ms,
                    decode_ms: result.decode_ms,
                    prompt_tokens: result.prompt_tokens,
                    generated_tokens: result.generated_tokens,
                },
            )),
            code => {
                take_string(result.text);
                Err(code_error(code, self.handle))
            }
        }
    }

    fn memory_stats(&self) -> Result<MemoryStats, KernelError> {
        let mut raw = ffi::EkMemoryStats {
            current_bytes: 0,
            peak_bytes: 0,
            limit_bytes: 0,
            model_bytes: 0,
            context_bytes: 0,
        };
        // SAFETY: `raw` is an initialized out-param.
        let status = unsafe { ffi::ek_get_memory_usage(self.handle, &mut raw) };
        self.check(status)?;
        Ok(MemoryStats {
            current_bytes: raw.current_bytes,
            peak_bytes: raw.peak_bytes,
            limit_bytes: raw.limit_bytes,
            model_bytes: raw.model_bytes,
            context_bytes: raw.context_bytes,
        })
    }

    fn set_memory_limit(&mut self, bytes: u64) -> Result<(), KernelError> {
        // SAFETY: simple setter on a live handle.
        let status = unsafe { ffi::ek_set_memory_limit(self.handle, bytes) };
        self.check(status)
    }

    fn set_memory_pressure_callback(&mut self, cb: Box<dyn Fn(u64, u64) + Send + Sync>) {
        let ctx = Box::new(PressureCtx { cb });
        // SAFETY: the context box stays alive in `self._pressure` until the
        // callback is replaced or the handle is freed (which clears it first).
        unsafe {
            ffi::ek_set_memory_pressure_callback(
                self.handle,
                Some(pressure_trampoline),
                &*ctx as *const PressureCtx as *mut c_void,
            );
        }
        self._pressure = Some(ctx);
    }

    fn reset_context(&mut self) -> Result<(), KernelError> {
        // SAFETY: simple call on a live handle.
        let status = unsafe { ffi::ek_reset(self.handle) };
        self.check(status)
    }
}

struct NativeStream {
    stream: *mut c_void,
    ctx_handle: *mut c_void,
    ended: bool,
}

// SAFETY: the stream handle is owned by the worker thread that owns the
// parent context; it is never shared.
unsafe impl Send for NativeStream {}

impl Drop for NativeStream {
    fn drop(&mut self) {
        // SAFETY: stream was returned by ek_generate_stream and is freed once.
        unsafe { ffi::ek_stream_free(self.stream) };
    }
}

impl KernelStream for NativeStream {
    fn next_token(&mut self) -> Result<Option<KernelToken>, KernelError> {
        if self.ended {
            return Ok(None);
        }
        // SAFETY: stream is live; token bytes are copied out and freed below.
        let result = unsafe { ffi::ek_stream_next(self.stream) };
        match KernelErrorCode::from_raw(result.err) {
            KernelErrorCode::Ok => {}
            KernelErrorCode::StreamEnded => {
                self.ended = true;
                if !result.data.is_null() {
                    // SAFETY: the kernel allocated `length` bytes at `data`.
                    unsafe { ffi::ek_free_bytes(result.data, result.length) };
                }
                return Ok(None);
            }
            code => {
                if !result.data.is_null() {
                    // SAFETY: as above.
                    unsafe { ffi::ek_free_bytes(result.data, result.length) };
                }
                return Err(code_error(code, self.ctx_handle));
            }
        }

        let bytes = if result.data.is_null() || result.length == 0 {
            Vec::new()
        } else {
            // SAFETY: the kernel allocated `length` bytes at `data`; we copy
            // them out before freeing.
            let bytes = unsafe { std::slice::from_raw_parts(result.data, result.length) }.to_vec();
            unsafe { ffi::ek_free_bytes(result.data, result.length) };
            bytes
        };

        if result.done {
            self.ended = true;
        }

        Ok(Some(KernelToken {
            bytes,
            confidence: result.has_confidence.then_some(result.confidence),
        }))
    }

    fn cancel(&mut self) {
        // SAFETY: cancel is a flag set; safe on a live stream.
        unsafe { ffi::ek_stream_cancel(self.stream) };
    }
}
