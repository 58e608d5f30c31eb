//! Model byte sources for workers.
//!
//! The worker thread asks its provider for model bytes during Init and
//! reports progress as they arrive. The production provider reads the cache
//! and falls back to the downloader; tests substitute an in-memory map.

use std::collections::HashMap;

use edgerun_core::{CancelToken, EngineError, ErrorKind, ModelCategory, ModelRegistry};
use edgerun_store::{DownloadProgress, ModelDownloader};

use crate::protocol::{InitPhase, InitProgress};

/// Bytes a worker loads into the kernel.
pub struct ModelBytes {
    /// Model weights.
    pub model: Vec<u8>,
    /// Multimodal projector, for vision models with a paired mmproj entry.
    pub projector: Option<Vec<u8>>,
}

/// Source of model bytes, called on the worker thread during Init.
pub trait ModelProvider: Send + Sync {
    /// Fetch the bytes for `model_id`, reporting progress along the way.
    fn fetch(
        &self,
        model_id: &str,
        progress: &mut dyn FnMut(InitProgress),
    ) -> Result<ModelBytes, EngineError>;
}

/// Provider backed by the model cache and downloader.
///
/// Runs on the worker thread; async store calls are bridged through the
/// host runtime handle captured at construction.
pub struct StoreModelProvider {
    handle: tokio::runtime::Handle,
    registry: ModelRegistry,
    downloader: ModelDownloader,
    cancel: CancelToken,
}

impl StoreModelProvider {
    /// Provider over `downloader`, resolving ids through `registry`.
    ///
    /// Must be called from within the host runtime.
    pub fn new(registry: ModelRegistry, downloader: ModelDownloader, cancel: CancelToken) -> Self {
        Self {
            handle: tokio::runtime::Handle::current(),
            registry,
            downloader,
            cancel,
        }
    }

    fn fetch_one(
        &self,
        model_id: &str,
        progress: &mut dyn FnMut(InitProgress),
    ) -> Result<Vec<u8>, EngineError> {
        let descriptor = self.registry.require(model_id)?.clone();
        let cancel = self.cancel.clone();

        let mut report = |p: DownloadProgress| {
            progress(InitProgress {
                phase: InitPhase::Downloading,
                // Download accounts for the bulk of init; hold one point
                // back for the kernel load.
                percent: p.percentage.min(99),
                detail: Some(format!(
                    "{} / {} bytes ({:.0} B/s)",
                    p.downloaded_bytes, p.total_bytes, p.speed_bytes_per_second
                )),
            });
        };

        let bytes = self.handle.block_on(async {
            self.downloader
                .ensure(&descriptor, &mut report, &cancel)
                .await
        })?;
        Ok(bytes)
    }
}

impl ModelProvider for StoreModelProvider {
    fn fetch(
        &self,
        model_id: &str,
        progress: &mut dyn FnMut(InitProgress),
    ) -> Result<ModelBytes, EngineError> {
        let model = self.fetch_one(model_id, progress)?;

        // Vision models load their paired projector alongside the weights.
        // The pairing convention is `<id>.mmproj` in the registry.
        let projector = match self.registry.get(model_id).map(|d| d.category) {
            Some(ModelCategory::Vision) => {
                let projector_id = format!("{model_id}.mmproj");
                match self.registry.get(&projector_id) {
                    Some(_) => Some(self.fetch_one(&projector_id, progress)?),
                    None => None,
                }
            }
            _ => None,
        };

        Ok(ModelBytes { model, projector })
    }
}

/// In-memory provider for tests and for embedders that manage bytes
/// themselves.
#[derive(Default)]
pub struct StaticModelProvider {
    models: HashMap<String, ModelBytes>,
}

impl StaticModelProvider {
    /// Empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add model bytes under `id`.
    pub fn insert(mut self, id: impl Into<String>, model: Vec<u8>) -> Self {
        self.models.insert(
            id.into(),
            ModelBytes {
                model,
                projector: None,
            },
        );
        self
    }

    /// Add model bytes plus a projector under `id`.
    pub fn insert_with_projector(
        mut self,
        id: impl Into<String>,
        model: Vec<u8>,
        projector: Vec<u8>,
    ) -> Self {
        self.models.insert(
            id.into(),
            ModelBytes {
                model,
                projector: Some(projector),
            },
        );
        self
    }
}

impl ModelProvider for StaticModelProvider {
    fn fetch(
        &self,
        model_id: &str,
        progress: &mut dyn FnMut(InitProgress),
    ) -> Result<ModelBytes, EngineError> {
        let entry = self.models.get(model_id).ok_or_else(|| {
            EngineError::new(
                ErrorKind::ModelNotFound,
                format!("model {model_id:?} is not available"),
            )
        })?;
        progress(InitProgress {
            phase: InitPhase::Downloading,
            percent: 99,
            detail: None,
        });
        Ok(ModelBytes {
            model: entry.model.clone(),
            projector: entry.projector.clone(),
        })
    }
}
