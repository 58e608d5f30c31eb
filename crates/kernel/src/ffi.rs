//! FFI bindings to the edge kernel C ABI.

use std::ffi::{c_char, c_void};

/// Init-time configuration passed by pointer. Model bytes are copied by the
/// kernel during `ek_init`; the pointers only need to outlive the call.
#[repr(C)]
pub(crate) struct EkConfig {
    pub(crate) backend: i32,
    pub(crate) max_context_length: u32,
    pub(crate) num_threads: u32,
    pub(crate) memory_limit_bytes: u64,
    pub(crate) model_data: *const u8,
    pub(crate) model_len: usize,
    pub(crate) projector_data: *const u8,
    pub(crate) projector_len: usize,
}

/// Result of a blocking generate: an owned C string plus a status code.
#[repr(C)]
pub(crate) struct EkStringResult {
    pub(crate) text: *mut c_char,
    pub(crate) err: i32,
}

/// Result of pulling one stream token.
#[repr(C)]
pub(crate) struct EkTokenResult {
    pub(crate) data: *mut u8,
    pub(crate) length: usize,
    pub(crate) confidence: f32,
    pub(crate) has_confidence: bool,
    pub(crate) done: bool,
    pub(crate) err: i32,
}

#[repr(C)]
pub(crate) struct EkMemoryStats {
    pub(crate) current_bytes: u64,
    pub(crate) peak_bytes: u64,
    pub(crate) limit_bytes: u64,
    pub(crate) model_bytes: u64,
    pub(crate) context_bytes: u64,
}

#[repr(C)]
pub(crate) struct EkVisionResult {
    pub(crate) text: *mut c_char,
    pub(crate) model_load_ms: u64,
    pub(crate) image_encode_ms: u64,
    pub(crate) prompt_eval_ms: u64,
    pub(crate) decode_ms: u64,
    pub(crate) prompt_tokens: u32,
    pub(crate) generated_tokens: u32,
    pub(crate) err: i32,
}

pub(crate) type EkPressureCallback =
    unsafe extern "C" fn(current_bytes: u64, limit_bytes: u64, user_data: *mut c_void);

#[repr(C)]
pub(crate) struct EkSamplingParams {
    pub(crate) max_tokens: u32,
    pub(crate) temperature: f32,
    pub(crate) top_p: f32,
    pub(crate) top_k: u32,
    pub(crate) repetition_penalty: f32,
    pub(crate) seed: u64,
    pub(crate) has_seed: bool,
    pub(crate) json_mode: bool,
    pub(crate) grammar: *const c_char,
    pub(crate) grammar_root: *const c_char,
}

unsafe extern "C" {
    pub(crate) fn ek_version() -> *const c_char;
    pub(crate) fn ek_detect_backend() -> i32;
    pub(crate) fn ek_backend_name(backend: i32) -> *const c_char;
    pub(crate) fn ek_gpu_available() -> bool;

    pub(crate) fn ek_config_default(out: *mut EkConfig);
    pub(crate) fn ek_init(config: *const EkConfig, out_err: *mut i32) -> *mut c_void;
    pub(crate) fn ek_free(handle: *mut c_void);

    pub(crate) fn ek_generate(
        handle: *mut c_void,
        prompt: *const u8,
        prompt_len: usize,
        params: *const EkSamplingParams,
    ) -> EkStringResult;

    pub(crate) fn ek_generate_stream(
        handle: *mut c_void,
        prompt: *const u8,
        prompt_len: usize,
        params: *const EkSamplingParams,
        out_err: *mut i32,
    ) -> *mut c_void;

    pub(crate) fn ek_stream_next(stream: *mut c_void) -> EkTokenResult;
    pub(crate) fn ek_stream_has_next(stream: *mut c_void) -> bool;
    pub(crate) fn ek_stream_cancel(stream: *mut c_void);
    pub(crate) fn ek_stream_free(stream: *mut c_void);

    pub(crate) fn ek_describe_frame(
        handle: *mut c_void,
        rgb: *const u8,
        rgb_len: usize,
        width: u32,
        height: u32,
        prompt: *const u8,
        prompt_len: usize,
        params: *const EkSamplingParams,
    ) -> EkVisionResult;

    pub(crate) fn ek_get_memory_usage(handle: *mut c_void, out: *mut EkMemoryStats) -> i32;
    pub(crate) fn ek_set_memory_limit(handle: *mut c_void, bytes: u64) -> i32;
    pub(crate) fn ek_set_memory_pressure_callback(
        handle: *mut c_void,
        cb: Option<EkPressureCallback>,
        user_data: *mut c_void,
    );

    pub(crate) fn ek_reset(handle: *mut c_void) -> i32;

    pub(crate) fn ek_get_model_info(
        handle: *mut c_void,
        out_name: *mut *mut c_char,
        out_architecture: *mut *mut c_char,
        out_parameter_count: *mut u64,
        out_quantization: *mut *mut c_char,
        out_trained_context_length: *mut u32,
        out_multimodal: *mut bool,
    ) -> i32;

    pub(crate) fn ek_error_string(err: i32) -> *const c_char;
    pub(crate) fn ek_get_last_error(handle: *mut c_void) -> *const c_char;
    pub(crate) fn ek_free_string(s: *mut c_char);
    pub(crate) fn ek_free_bytes(data: *mut u8, length: usize);
}
