#![deny(missing_docs)]
#![deny(unreachable_pub)]

//! Typed call surface over the edge inference kernel.
//!
//! The kernel itself (a llama.cpp-class native library) is consumed through a
//! fixed C ABI. This crate presents it as a small set of traits so the rest of
//! the runtime never touches a raw handle: [`Kernel`] opens a model into a
//! [`KernelContext`], which generates text either in one call or through a
//! [`KernelStream`]. A deterministic scripted backend lives in [`mock`] and is
//! what tests and the default CLI build run against; the FFI-backed backend is
//! behind the `native-kernel` feature.

/// Public API: traits, data types, and error translation.
pub mod api;

/// Deterministic scripted backend.
pub mod mock;

#[cfg(feature = "native-kernel")]
mod ffi;

#[cfg(feature = "native-kernel")]
mod native;

pub use api::{
    Backend, Kernel, KernelConfig, KernelContext, KernelError, KernelErrorCode, KernelStream,
    KernelToken, MemoryStats, ModelInfo, SamplingParams, VisionTimings,
};
pub use mock::MockKernel;

#[cfg(feature = "native-kernel")]
pub use native::NativeKernel;
