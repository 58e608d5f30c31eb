//! Public runtime surface.
//!
//! A [`Runtime`] owns one worker and the supervisor wiring for it: it
//! enforces the one-kernel-request-in-flight contract, exposes async and
//! stream surfaces, forwards QoS policy to the worker, and feeds latency
//! samples back into the scheduler's workload record.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;

use edgerun_core::{
    CancelToken, DeviceHint, EngineConfig, EngineError, ErrorKind, GenerateResult,
    GenerationRequest, StreamChunk,
};
use edgerun_kernel::{Kernel, MemoryStats, ModelInfo};
use edgerun_store::{DownloaderConfig, ModelCache, ModelDownloader};
use edgerun_supervisor::{Budget, Frame, FrameQueue, Priority, Scheduler, WorkloadHandle};

use crate::protocol::{
    DEFAULT_REQUEST_TIMEOUT, FrameDescription, FramePayload, InitProgress, MemoryPressureReport,
    ProtocolClient, RequestId, ResponsePayload, WorkerRequest,
};
use crate::provider::{ModelProvider, StoreModelProvider};
use crate::worker::{WorkerOptions, spawn_worker};

/// Events surfaced to embedders.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// Init progress (download, load, ready).
    InitProgress(InitProgress),
    /// The kernel crossed its memory-pressure threshold.
    MemoryPressure(MemoryPressureReport),
}

/// Options for building a runtime.
pub struct RuntimeOptions {
    /// Kernel implementation.
    pub kernel: Arc<dyn Kernel>,
    /// Registry resolving model ids to descriptors.
    pub registry: edgerun_core::ModelRegistry,
    /// Cache root override; `None` uses the user data directory.
    pub cache_root: Option<PathBuf>,
    /// Downloader tunables.
    pub downloader: DownloaderConfig,
    /// Per-request protocol timeout.
    pub protocol_timeout: Duration,
    /// Scheduler to register with, when supervision is wanted.
    pub scheduler: Option<Arc<Scheduler>>,
    /// Workload priority when registered.
    pub priority: Priority,
    /// Budget attached to the workload, when any.
    pub budget: Option<Budget>,
    /// Workload name; also the key in QoS policy updates.
    pub workload_name: Option<String>,
    /// Model byte source override. `None` uses the cache + downloader.
    pub provider: Option<Arc<dyn ModelProvider>>,
    /// Callback for init progress (download, load, ready). Also mirrored on
    /// the event stream.
    pub on_init_progress: Option<Arc<dyn Fn(InitProgress) + Send + Sync>>,
}

impl RuntimeOptions {
    /// Options with everything at its default for `kernel`.
    pub fn new(kernel: Arc<dyn Kernel>) -> Self {
        Self {
            kernel,
            registry: edgerun_core::ModelRegistry::new(),
            cache_root: None,
            downloader: DownloaderConfig::default(),
            protocol_timeout: DEFAULT_REQUEST_TIMEOUT,
            scheduler: None,
            priority: Priority::Medium,
            budget: None,
            workload_name: None,
            provider: None,
            on_init_progress: None,
        }
    }
}

struct BusyFlag {
    busy: AtomicBool,
}

/// Releases the one-in-flight slot on drop.
struct BusyGuard {
    flag: Arc<BusyFlag>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.flag.busy.store(false, Ordering::SeqCst);
    }
}

struct RuntimeCore {
    protocol: Arc<ProtocolClient>,
    backend: String,
    config: EngineConfig,
    busy: Arc<BusyFlag>,
    current_stream: Arc<Mutex<Option<RequestId>>>,
    workload: Mutex<Option<WorkloadHandle>>,
    events_tx: broadcast::Sender<RuntimeEvent>,
    disposed: AtomicBool,
    download_cancel: CancelToken,
    qos_forwarder: Option<tokio::task::JoinHandle<()>>,
    // Detached on dispose; the thread exits once its mailbox closes.
    _worker_thread: std::thread::JoinHandle<()>,
}

impl RuntimeCore {
    async fn build(
        config: EngineConfig,
        options: RuntimeOptions,
        default_name: &str,
        frame_queue: Option<Arc<FrameQueue>>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        // Explicit GPU fails loud before anything is loaded; only `auto`
        // falls back.
        if config.device == DeviceHint::Gpu && !options.kernel.gpu_available() {
            return Err(EngineError::new(
                ErrorKind::UnsupportedBackend,
                "GPU was requested explicitly but no GPU backend is available",
            )
            .with_hint("use device \"auto\" or \"cpu\""));
        }

        let workload_name = options
            .workload_name
            .unwrap_or_else(|| default_name.to_string());
        let download_cancel = CancelToken::new();

        let provider: Arc<dyn ModelProvider> = match options.provider {
            Some(provider) => provider,
            None => {
                options.registry.require(&config.model_id)?;
                let cache = if config.cache_enabled {
                    match &options.cache_root {
                        Some(root) => ModelCache::open_at(root.join(&config.cache_namespace))?,
                        None => ModelCache::open(&config.cache_namespace)?,
                    }
                } else {
                    // Ephemeral cache: bytes do not outlive this process's
                    // temp directory.
                    ModelCache::open_at(
                        std::env::temp_dir()
                            .join(format!("edgerun-ephemeral-{}", std::process::id()))
                            .join(&config.cache_namespace),
                    )?
                };
                Arc::new(StoreModelProvider::new(
                    options.registry.clone(),
                    ModelDownloader::with_config(cache, options.downloader.clone()),
                    download_cancel.clone(),
                ))
            }
        };

        let (to_worker, from_worker, worker_thread) = spawn_worker(
            options.kernel.clone(),
            provider,
            WorkerOptions {
                name: workload_name.clone(),
                frame_queue,
            },
        )?;
        let protocol = Arc::new(ProtocolClient::new(
            to_worker,
            from_worker,
            options.protocol_timeout,
        ));

        let (events_tx, _) = broadcast::channel(128);

        let mut progress_rx = protocol.subscribe_progress();
        let progress_events = events_tx.clone();
        let progress_cb = options.on_init_progress.clone();
        tokio::spawn(async move {
            while let Ok((_, progress)) = progress_rx.recv().await {
                if let Some(cb) = &progress_cb {
                    cb(progress.clone());
                }
                let _ = progress_events.send(RuntimeEvent::InitProgress(progress));
            }
        });

        let mut pressure_rx = protocol.subscribe_pressure();
        let pressure_events = events_tx.clone();
        tokio::spawn(async move {
            while let Ok(report) = pressure_rx.recv().await {
                let _ = pressure_events.send(RuntimeEvent::MemoryPressure(report));
            }
        });

        // Supervision wiring: register the workload and forward the QoS map
        // to the worker as policy control frames.
        let mut workload = None;
        let mut qos_forwarder = None;
        if let Some(scheduler) = &options.scheduler {
            workload = Some(scheduler.register(
                workload_name.clone(),
                options.priority,
                options.budget,
            ));

            let mut qos_rx = scheduler.qos_updates();
            let protocol_for_policy = Arc::clone(&protocol);
            qos_forwarder = Some(tokio::spawn(async move {
                while qos_rx.changed().await.is_ok() {
                    let map = qos_rx.borrow().clone();
                    protocol_for_policy.send_policy(map);
                }
            }));
        }

        let init_config = config.clone();
        let payload = protocol
            .request(|id| WorkerRequest::Init {
                id,
                config: init_config,
            })
            .await;

        let backend = match payload {
            Ok(ResponsePayload::Ready { backend }) => backend,
            Ok(other) => {
                tracing::warn!(?other, "unexpected init payload");
                return Err(EngineError::new(
                    ErrorKind::GenerationFailed,
                    "worker returned an unexpected init payload",
                ));
            }
            Err(err) => {
                if let Some(task) = qos_forwarder {
                    task.abort();
                }
                if let Some(handle) = workload {
                    handle.unregister();
                }
                return Err(err);
            }
        };

        Ok(Self {
            protocol,
            backend,
            config,
            busy: Arc::new(BusyFlag {
                busy: AtomicBool::new(false),
            }),
            current_stream: Arc::new(Mutex::new(None)),
            workload: Mutex::new(workload),
            events_tx,
            disposed: AtomicBool::new(false),
            download_cancel,
            qos_forwarder,
            _worker_thread: worker_thread,
        })
    }

    /// Claim the one-in-flight slot, failing fast with Busy.
    fn acquire_busy(&self) -> Result<BusyGuard, EngineError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(EngineError::new(ErrorKind::Disposed, "runtime was disposed"));
        }
        if self.busy.busy.swap(true, Ordering::SeqCst) {
            return Err(EngineError::new(
                ErrorKind::Busy,
                "another kernel request is in flight",
            ));
        }
        Ok(BusyGuard {
            flag: Arc::clone(&self.busy),
        })
    }

    fn record_generation(&self, time_ms: u64, tokens_per_second: f64) {
        let workload = self.workload.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = workload.as_ref() {
            handle.record_generation(time_ms as f64, tokens_per_second);
        }
    }

    async fn generate(&self, request: GenerationRequest) -> Result<GenerateResult, EngineError> {
        let _guard = self.acquire_busy()?;
        let payload = self
            .protocol
            .request(|id| WorkerRequest::Generate { id, request })
            .await?;
        match payload {
            ResponsePayload::Generated { result } => {
                self.record_generation(result.time_ms, result.tokens_per_second);
                Ok(result)
            }
            other => {
                tracing::warn!(?other, "unexpected generate payload");
                Err(EngineError::new(
                    ErrorKind::GenerationFailed,
                    "worker returned an unexpected generate payload",
                ))
            }
        }
    }

    fn generate_stream(self: &Arc<Self>, request: GenerationRequest) -> Result<TokenStream, EngineError> {
        let guard = self.acquire_busy()?;
        let (id, rx) = self
            .protocol
            .start_stream(|id| WorkerRequest::GenerateStream { id, request })?;
        {
            let mut current = self.current_stream.lock().unwrap_or_else(|e| e.into_inner());
            *current = Some(id);
        }
        Ok(TokenStream {
            core: Arc::clone(self),
            rx,
            id,
            done_seen: false,
            guard: Some(guard),
        })
    }

    async fn cancel_generation(&self) -> Result<(), EngineError> {
        let target = {
            let current = self.current_stream.lock().unwrap_or_else(|e| e.into_inner());
            *current
        };
        match target {
            Some(id) => self.protocol.cancel(id).await,
            None => Ok(()),
        }
    }

    async fn memory_stats(&self) -> Result<MemoryStats, EngineError> {
        match self
            .protocol
            .request(|id| WorkerRequest::GetMemoryStats { id })
            .await?
        {
            ResponsePayload::MemoryStats { stats } => Ok(stats),
            other => Err(unexpected_payload("memory stats", other)),
        }
    }

    async fn model_info(&self) -> Result<ModelInfo, EngineError> {
        match self
            .protocol
            .request(|id| WorkerRequest::GetModelInfo { id })
            .await?
        {
            ResponsePayload::ModelInfo { info } => Ok(info),
            other => Err(unexpected_payload("model info", other)),
        }
    }

    async fn reset_context(&self) -> Result<(), EngineError> {
        match self
            .protocol
            .request(|id| WorkerRequest::ResetContext { id })
            .await?
        {
            ResponsePayload::ContextReset => Ok(()),
            other => Err(unexpected_payload("context reset", other)),
        }
    }

    async fn unload_model(&self) -> Result<(), EngineError> {
        match self
            .protocol
            .request(|id| WorkerRequest::UnloadModel { id })
            .await?
        {
            ResponsePayload::Unloaded => Ok(()),
            other => Err(unexpected_payload("unload", other)),
        }
    }

    /// Tear the runtime down: cancel in-flight work, terminate the worker,
    /// fail everything pending with Disposed.
    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.download_cancel.cancel();

        let target = {
            let mut current = self.current_stream.lock().unwrap_or_else(|e| e.into_inner());
            current.take()
        };
        if let Some(id) = target {
            self.protocol.cancel_nowait(id);
        }

        self.protocol.send_nowait(|id| WorkerRequest::Free { id });
        self.protocol.fail_pending();

        if let Some(task) = &self.qos_forwarder {
            task.abort();
        }
        let handle = {
            let mut workload = self.workload.lock().unwrap_or_else(|e| e.into_inner());
            workload.take()
        };
        if let Some(handle) = handle {
            handle.unregister();
        }
    }
}

fn unexpected_payload(what: &str, payload: ResponsePayload) -> EngineError {
    tracing::warn!(?payload, what, "unexpected response payload");
    EngineError::new(
        ErrorKind::GenerationFailed,
        format!("worker returned an unexpected {what} payload"),
    )
}

/// Async iterator over one generation's chunks.
///
/// Dropping the stream before the terminal chunk cancels the request
/// best-effort and releases the in-flight slot.
pub struct TokenStream {
    core: Arc<RuntimeCore>,
    rx: tokio::sync::mpsc::UnboundedReceiver<StreamChunk>,
    id: RequestId,
    done_seen: bool,
    // Released at the terminal chunk so the slot frees as soon as the
    // stream completes, not when the consumer drops its handle.
    guard: Option<BusyGuard>,
}

impl TokenStream {
    /// The protocol id of this stream's request.
    pub fn request_id(&self) -> RequestId {
        self.id
    }

    /// Next chunk; `None` after the terminal chunk.
    pub async fn next(&mut self) -> Option<StreamChunk> {
        if self.done_seen {
            return None;
        }
        let chunk = self.rx.recv().await?;
        if chunk.done {
            self.done_seen = true;
            self.guard = None;
            {
                let mut current = self
                    .core
                    .current_stream
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                if *current == Some(self.id) {
                    *current = None;
                }
            }
            if let Some(stats) = &chunk.stats {
                self.core.record_generation(stats.time_ms, stats.tokens_per_second);
            }
        }
        Some(chunk)
    }

    /// Drain the stream into a reduced result.
    pub async fn collect(mut self) -> Result<GenerateResult, EngineError> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next().await {
            chunks.push(chunk);
        }
        GenerateResult::reduce(chunks)
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        if !self.done_seen {
            self.core.protocol.cancel_nowait(self.id);
        }
        let mut current = self
            .core
            .current_stream
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if *current == Some(self.id) {
            *current = None;
        }
    }
}

/// Text-generation runtime over a worker-hosted kernel.
pub struct Runtime {
    core: Arc<RuntimeCore>,
}

impl Runtime {
    /// Initialize a runtime: resolve the backend, fetch model bytes (cache
    /// first, network on miss), and load the kernel.
    pub async fn init(config: EngineConfig, options: RuntimeOptions) -> Result<Self, EngineError> {
        let core = RuntimeCore::build(config, options, "inference", None).await?;
        Ok(Self { core: Arc::new(core) })
    }

    /// Name of the backend the kernel initialized on ("GPU"/"CPU").
    pub fn backend(&self) -> &str {
        &self.core.backend
    }

    /// The frozen configuration this runtime was initialized with.
    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// Subscribe to runtime events (init progress, memory pressure).
    pub fn subscribe_events(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.core.events_tx.subscribe()
    }

    /// Blocking-style generation. Fails fast with Busy when another kernel
    /// request is in flight.
    pub async fn generate(&self, request: GenerationRequest) -> Result<GenerateResult, EngineError> {
        self.core.generate(request).await
    }

    /// Streaming generation.
    pub fn generate_stream(&self, request: GenerationRequest) -> Result<TokenStream, EngineError> {
        self.core.generate_stream(request)
    }

    /// Cancel the in-flight stream, if any. The stream still terminates
    /// with a `cancelled` chunk.
    pub async fn cancel_generation(&self) -> Result<(), EngineError> {
        self.core.cancel_generation().await
    }

    /// Kernel memory accounting. Available even while a stream runs.
    pub async fn memory_stats(&self) -> Result<MemoryStats, EngineError> {
        self.core.memory_stats().await
    }

    /// Loaded model metadata. Available even while a stream runs.
    pub async fn model_info(&self) -> Result<ModelInfo, EngineError> {
        self.core.model_info().await
    }

    /// Clear the KV cache.
    pub async fn reset_context(&self) -> Result<(), EngineError> {
        self.core.reset_context().await
    }

    /// Drop the kernel context, keeping the worker for a later init.
    pub async fn unload_model(&self) -> Result<(), EngineError> {
        self.core.unload_model().await
    }

    /// Tear everything down. Pending requests fail with Disposed.
    pub async fn dispose(self) {
        self.core.dispose().await;
    }
}

/// Vision runtime: a persistent multimodal context plus a frame queue.
pub struct VisionRuntime {
    core: Arc<RuntimeCore>,
    queue: Arc<FrameQueue>,
}

impl VisionRuntime {
    /// Initialize a vision runtime. The worker owns a frame queue that
    /// producers feed through [`VisionRuntime::enqueue_frame`].
    pub async fn init(config: EngineConfig, options: RuntimeOptions) -> Result<Self, EngineError> {
        let queue = Arc::new(FrameQueue::new());
        let core = RuntimeCore::build(config, options, "vision", Some(Arc::clone(&queue))).await?;
        Ok(Self {
            core: Arc::new(core),
            queue,
        })
    }

    /// Backend name ("GPU"/"CPU").
    pub fn backend(&self) -> &str {
        &self.core.backend
    }

    /// Subscribe to runtime events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.core.events_tx.subscribe()
    }

    /// Offer a frame. Returns true when a waiting frame was replaced (and
    /// counted as dropped). Never blocks.
    pub fn enqueue_frame(&self, frame: Frame) -> bool {
        self.queue.enqueue(frame)
    }

    /// Frames replaced while waiting.
    pub fn dropped_frames(&self) -> u64 {
        self.queue.dropped_count()
    }

    /// Zero the dropped-frame counter.
    pub fn reset_frame_counters(&self) {
        self.queue.reset_counters();
    }

    /// One-shot frame description.
    pub async fn describe_frame(
        &self,
        frame: Frame,
        prompt: impl Into<String>,
        request: GenerationRequest,
    ) -> Result<FrameDescription, EngineError> {
        let _guard = self.core.acquire_busy()?;
        let prompt = prompt.into();
        let payload = self
            .core
            .protocol
            .request(|id| WorkerRequest::DescribeFrame {
                id,
                frame: FramePayload {
                    rgb: frame.rgb,
                    width: frame.width,
                    height: frame.height,
                },
                prompt,
                request,
            })
            .await?;
        match payload {
            ResponsePayload::FrameDescribed { description } => {
                self.core.record_generation(
                    description.timings.total_ms,
                    description.timings.tokens_per_second,
                );
                Ok(description)
            }
            other => Err(unexpected_payload("frame description", other)),
        }
    }

    /// Describe the next queued frame. `Ok(None)` when nothing was pending
    /// (or the workload is paused).
    pub async fn process_next_frame(
        &self,
        prompt: impl Into<String>,
        request: GenerationRequest,
    ) -> Result<Option<FrameDescription>, EngineError> {
        let _guard = self.core.acquire_busy()?;
        let prompt = prompt.into();
        let payload = self
            .core
            .protocol
            .request(|id| WorkerRequest::ProcessNextFrame { id, prompt, request })
            .await?;
        match payload {
            ResponsePayload::FrameDescribed { description } => {
                self.core.record_generation(
                    description.timings.total_ms,
                    description.timings.tokens_per_second,
                );
                Ok(Some(description))
            }
            ResponsePayload::NoFramePending => Ok(None),
            other => Err(unexpected_payload("frame description", other)),
        }
    }

    /// Kernel memory accounting.
    pub async fn memory_stats(&self) -> Result<MemoryStats, EngineError> {
        self.core.memory_stats().await
    }

    /// Loaded model metadata.
    pub async fn model_info(&self) -> Result<ModelInfo, EngineError> {
        self.core.model_info().await
    }

    /// Clear the KV cache.
    pub async fn reset_context(&self) -> Result<(), EngineError> {
        self.core.reset_context().await
    }

    /// Tear everything down.
    pub async fn dispose(self) {
        self.core.dispose().await;
    }
}
