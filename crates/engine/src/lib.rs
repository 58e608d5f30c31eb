#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Worker-isolated inference engine.
//!
//! A runtime owns a background worker thread that holds the kernel handle
//! and speaks a typed, correlated request/response protocol with the host.
//! The host side stays async and single-tasked; the worker is the only
//! place real blocking happens.

pub mod api;
pub mod protocol;

mod provider;
mod vision;
mod worker;

pub use api::{Runtime, RuntimeEvent, RuntimeOptions, TokenStream, VisionRuntime};
pub use protocol::{
    FrameDescription, FramePayload, FrameTimings, InitPhase, InitProgress, MemoryPressureReport,
    ProtocolClient, RequestId, ResponsePayload, WorkerRequest, WorkerResponse,
};
pub use provider::{ModelBytes, ModelProvider, StaticModelProvider, StoreModelProvider};
