#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Shared data model for the edgerun runtime: model descriptors, generation
//! requests and stream chunks, the typed error surface, cancellation, and the
//! engine configuration.

pub mod cancel;
pub mod config;
pub mod error;
pub mod model;
pub mod request;

pub use cancel::CancelToken;
pub use config::{DeviceHint, EngineConfig};
pub use error::{EngineError, ErrorKind};
pub use model::{ModelCategory, ModelDescriptor, ModelRegistry};
pub use request::{FinalStats, GenerateResult, GenerationRequest, StopReason, StreamChunk};
