//! Typed, correlated messaging between the host and a worker.
//!
//! Every frame is a JSON-serializable tagged value `{type, id, ...}`. Each
//! request carries a channel-unique monotonic id; responses echo it. Stream
//! chunks for one id arrive in token order with exactly one terminal chunk;
//! across ids the channel may interleave. Responses that match no pending
//! entry are logged and dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};

use edgerun_core::{EngineConfig, EngineError, ErrorKind, GenerationRequest, StreamChunk};
use edgerun_kernel::{MemoryStats, ModelInfo, VisionTimings};
use edgerun_supervisor::QosLevel;

/// Correlates a response with its request. Monotonic within a channel.
pub type RequestId = u64;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

mod rgb_b64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as B64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&B64.encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(de)?;
        B64.decode(raw.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// RGB frame payload as it crosses the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramePayload {
    /// Packed RGB bytes, base64 on the wire.
    #[serde(with = "rgb_b64")]
    pub rgb: Vec<u8>,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// Host -> worker frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Load the configured model and initialize the kernel.
    Init {
        /// Request id.
        id: RequestId,
        /// Frozen engine configuration.
        config: EngineConfig,
    },
    /// Blocking generation.
    Generate {
        /// Request id.
        id: RequestId,
        /// Generation request.
        request: GenerationRequest,
    },
    /// Streaming generation.
    GenerateStream {
        /// Request id.
        id: RequestId,
        /// Generation request.
        request: GenerationRequest,
    },
    /// Cancel an in-flight request.
    Cancel {
        /// Request id of the cancel itself.
        id: RequestId,
        /// Id of the request to cancel.
        target: RequestId,
    },
    /// Kernel memory accounting. Serviced even mid-stream.
    GetMemoryStats {
        /// Request id.
        id: RequestId,
    },
    /// Loaded model metadata. Serviced even mid-stream.
    GetModelInfo {
        /// Request id.
        id: RequestId,
    },
    /// Clear the KV cache.
    ResetContext {
        /// Request id.
        id: RequestId,
    },
    /// Drop the kernel context, keeping the worker alive for a later Init.
    UnloadModel {
        /// Request id.
        id: RequestId,
    },
    /// One-shot frame description (vision workers).
    DescribeFrame {
        /// Request id.
        id: RequestId,
        /// Frame to describe.
        frame: FramePayload,
        /// Prompt.
        prompt: String,
        /// Sampling request.
        request: GenerationRequest,
    },
    /// Describe the next queued frame, if any (vision workers).
    ProcessNextFrame {
        /// Request id.
        id: RequestId,
        /// Prompt.
        prompt: String,
        /// Sampling request.
        request: GenerationRequest,
    },
    /// Embedding request. Answered with a typed error: embedding pipelines
    /// are leaf libraries, not kernel surface.
    Embed {
        /// Request id.
        id: RequestId,
        /// Text to embed.
        text: String,
    },
    /// Tear the worker down.
    Free {
        /// Request id.
        id: RequestId,
    },
    /// QoS control frame; applied to the next request, never mid-stream.
    PolicyUpdate {
        /// New QoS level per workload name.
        qos_by_workload: BTreeMap<String, QosLevel>,
    },
}

impl WorkerRequest {
    /// The correlation id, when the frame carries one.
    pub fn id(&self) -> Option<RequestId> {
        match self {
            WorkerRequest::Init { id, .. }
            | WorkerRequest::Generate { id, .. }
            | WorkerRequest::GenerateStream { id, .. }
            | WorkerRequest::Cancel { id, .. }
            | WorkerRequest::GetMemoryStats { id }
            | WorkerRequest::GetModelInfo { id }
            | WorkerRequest::ResetContext { id }
            | WorkerRequest::UnloadModel { id }
            | WorkerRequest::DescribeFrame { id, .. }
            | WorkerRequest::ProcessNextFrame { id, .. }
            | WorkerRequest::Embed { id, .. }
            | WorkerRequest::Free { id } => Some(*id),
            WorkerRequest::PolicyUpdate { .. } => None,
        }
    }
}

/// Init progress phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitPhase {
    /// Fetching model bytes (0 immediately on a cache hit).
    Downloading,
    /// Kernel is loading the model.
    Loading,
    /// Worker is ready.
    Ready,
}

/// One init progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitProgress {
    /// Current phase.
    pub phase: InitPhase,
    /// Percent complete within the overall init.
    pub percent: u8,
    /// Optional detail (download speed, byte counts).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Unsolicited memory-pressure notification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryPressureReport {
    /// Bytes in use when the threshold was crossed.
    pub current_bytes: u64,
    /// Configured limit.
    pub limit_bytes: u64,
    /// `current / limit`. Above 1.0 the limit is already exceeded and the
    /// next kernel call will likely fail.
    pub pressure_ratio: f64,
    /// Unix milliseconds.
    pub timestamp_ms: i64,
}

/// Timing breakdown for one described frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameTimings {
    /// Model preparation time in ms.
    pub model_load_ms: u64,
    /// Image encoding time in ms.
    pub image_encode_ms: u64,
    /// Prompt evaluation time in ms.
    pub prompt_eval_ms: u64,
    /// Token decode time in ms.
    pub decode_ms: u64,
    /// Prompt tokens evaluated.
    pub prompt_tokens: u32,
    /// Tokens generated.
    pub generated_tokens: u32,
    /// End-to-end time in ms.
    pub total_ms: u64,
    /// Generated tokens per second.
    pub tokens_per_second: f64,
}

impl FrameTimings {
    pub(crate) fn from_vision(timings: VisionTimings, total_ms: u64) -> Self {
        let decode_s = timings.decode_ms as f64 / 1000.0;
        Self {
            model_load_ms: timings.model_load_ms,
            image_encode_ms: timings.image_encode_ms,
            prompt_eval_ms: timings.prompt_eval_ms,
            decode_ms: timings.decode_ms,
            prompt_tokens: timings.prompt_tokens,
            generated_tokens: timings.generated_tokens,
            total_ms,
            tokens_per_second: if decode_s > 0.0 {
                f64::from(timings.generated_tokens) / decode_s
            } else {
                0.0
            },
        }
    }
}

/// Result of describing one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameDescription {
    /// Generated description.
    pub description: String,
    /// Per-frame timing breakdown.
    pub timings: FrameTimings,
}

/// Terminal payloads for successful requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponsePayload {
    /// Init completed.
    Ready {
        /// Backend the kernel initialized on ("GPU"/"CPU").
        backend: String,
    },
    /// Blocking generation completed.
    Generated {
        /// The result.
        result: edgerun_core::GenerateResult,
    },
    /// Memory accounting.
    MemoryStats {
        /// Kernel-reported stats.
        stats: MemoryStats,
    },
    /// Model metadata.
    ModelInfo {
        /// Kernel-reported info.
        info: ModelInfo,
    },
    /// A frame was described.
    FrameDescribed {
        /// Description plus timings.
        description: FrameDescription,
    },
    /// `ProcessNextFrame` found an empty queue.
    NoFramePending,
    /// Context reset completed.
    ContextReset,
    /// Model unloaded.
    Unloaded,
    /// Worker tore down.
    Freed,
    /// A cancel request was acknowledged.
    CancelAcked {
        /// The request that was asked to stop.
        target: RequestId,
    },
}

/// Worker -> host frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    /// Terminal success for `id`.
    Success {
        /// Echoed request id.
        id: RequestId,
        /// Payload.
        payload: ResponsePayload,
    },
    /// Terminal failure for `id`.
    Error {
        /// Echoed request id.
        id: RequestId,
        /// Typed error (`{code, message, details?}` on the wire).
        error: EngineError,
    },
    /// One stream element for `id`; terminal when `chunk.done`.
    StreamChunk {
        /// Echoed request id.
        id: RequestId,
        /// The chunk.
        chunk: StreamChunk,
    },
    /// Init progress for `id`.
    Progress {
        /// Echoed request id.
        id: RequestId,
        /// Progress event.
        progress: InitProgress,
    },
    /// Acknowledgement of a Cancel request.
    CancelAck {
        /// Echoed cancel-request id.
        id: RequestId,
        /// The request that was asked to stop.
        target: RequestId,
    },
    /// Unsolicited memory-pressure push; carries no request id.
    MemoryPressure {
        /// The report.
        report: MemoryPressureReport,
    },
}

enum Pending {
    Unary(oneshot::Sender<Result<ResponsePayload, EngineError>>),
    Stream(mpsc::UnboundedSender<StreamChunk>),
}

/// Host side of the channel: id allocation, the pending map, timeouts, and
/// routing of streamed, unsolicited, and terminal frames.
pub struct ProtocolClient {
    to_worker: mpsc::UnboundedSender<WorkerRequest>,
    pending: Arc<Mutex<HashMap<RequestId, Pending>>>,
    next_id: AtomicU64,
    timeout: Duration,
    pressure_tx: broadcast::Sender<MemoryPressureReport>,
    progress_tx: broadcast::Sender<(RequestId, InitProgress)>,
}

impl ProtocolClient {
    /// Build the client over a worker channel pair and spawn the dispatch
    /// task.
    pub fn new(
        to_worker: mpsc::UnboundedSender<WorkerRequest>,
        mut from_worker: mpsc::UnboundedReceiver<WorkerResponse>,
        timeout: Duration,
    ) -> Self {
        let pending: Arc<Mutex<HashMap<RequestId, Pending>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (pressure_tx, _) = broadcast::channel(64);
        let (progress_tx, _) = broadcast::channel(64);

        let dispatch_pending = Arc::clone(&pending);
        let dispatch_pressure = pressure_tx.clone();
        let dispatch_progress = progress_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = from_worker.recv().await {
                dispatch(&dispatch_pending, &dispatch_pressure, &dispatch_progress, frame);
            }
            // Worker gone: everything still pending fails with Disposed.
            let mut pending = dispatch_pending.lock().unwrap_or_else(|e| e.into_inner());
            for (_, entry) in pending.drain() {
                fail_entry(entry, disposed_error());
            }
        });

        Self {
            to_worker,
            pending,
            next_id: AtomicU64::new(1),
            timeout: if timeout.is_zero() {
                DEFAULT_REQUEST_TIMEOUT
            } else {
                timeout
            },
            pressure_tx,
            progress_tx,
        }
    }

    fn alloc_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send one request and await its terminal response.
    ///
    /// Times out after the configured window; cleanup after a timeout is a
    /// best-effort fire-and-forget cancel to the worker.
    pub async fn request(
        &self,
        build: impl FnOnce(RequestId) -> WorkerRequest,
    ) -> Result<ResponsePayload, EngineError> {
        let id = self.alloc_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.insert(id, Pending::Unary(tx));
        }

        if self.to_worker.send(build(id)).is_err() {
            self.remove_pending(id);
            return Err(disposed_error());
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(disposed_error()),
            Err(_) => {
                self.remove_pending(id);
                let cancel_id = self.alloc_id();
                let _ = self.to_worker.send(WorkerRequest::Cancel {
                    id: cancel_id,
                    target: id,
                });
                Err(EngineError::new(
                    ErrorKind::TimedOut,
                    format!("no response for request {id} within {:?}", self.timeout),
                ))
            }
        }
    }

    /// Open a streaming request. Chunks arrive on the returned receiver; the
    /// entry clears itself when the terminal chunk passes through.
    pub fn start_stream(
        &self,
        build: impl FnOnce(RequestId) -> WorkerRequest,
    ) -> Result<(RequestId, mpsc::UnboundedReceiver<StreamChunk>), EngineError> {
        let id = self.alloc_id();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.insert(id, Pending::Stream(tx));
        }

        if self.to_worker.send(build(id)).is_err() {
            self.remove_pending(id);
            return Err(disposed_error());
        }
        Ok((id, rx))
    }

    /// Ask the worker to cancel `target` and await the acknowledgement.
    pub async fn cancel(&self, target: RequestId) -> Result<(), EngineError> {
        match self
            .request(|id| WorkerRequest::Cancel { id, target })
            .await?
        {
            ResponsePayload::CancelAcked { .. } => Ok(()),
            other => {
                tracing::warn!(?other, "unexpected payload for cancel request");
                Ok(())
            }
        }
    }

    /// Fire-and-forget cancel, for teardown paths that cannot await.
    pub fn cancel_nowait(&self, target: RequestId) {
        let id = self.alloc_id();
        let _ = self.to_worker.send(WorkerRequest::Cancel { id, target });
    }

    /// Fire-and-forget request with no pending entry; any terminal response
    /// is logged and dropped by dispatch.
    pub fn send_nowait(&self, build: impl FnOnce(RequestId) -> WorkerRequest) {
        let id = self.alloc_id();
        let _ = self.to_worker.send(build(id));
    }

    /// Push a QoS control frame.
    pub fn send_policy(&self, qos_by_workload: BTreeMap<String, QosLevel>) {
        let _ = self
            .to_worker
            .send(WorkerRequest::PolicyUpdate { qos_by_workload });
    }

    /// Subscribe to unsolicited memory-pressure reports.
    pub fn subscribe_pressure(&self) -> broadcast::Receiver<MemoryPressureReport> {
        self.pressure_tx.subscribe()
    }

    /// Subscribe to init progress events.
    pub fn subscribe_progress(&self) -> broadcast::Receiver<(RequestId, InitProgress)> {
        self.progress_tx.subscribe()
    }

    /// Fail every pending request with Disposed. Used by the facade on
    /// teardown.
    pub fn fail_pending(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        for (_, entry) in pending.drain() {
            fail_entry(entry, disposed_error());
        }
    }

    fn remove_pending(&self, id: RequestId) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.remove(&id);
    }
}

fn disposed_error() -> EngineError {
    EngineError::new(ErrorKind::Disposed, "worker is gone")
}

fn fail_entry(entry: Pending, error: EngineError) {
    match entry {
        Pending::Unary(tx) => {
            let _ = tx.send(Err(error));
        }
        Pending::Stream(tx) => {
            let _ = tx.send(error_terminal_chunk(error));
        }
    }
}

/// Synthesize an error-terminal chunk for stream consumers.
pub(crate) fn error_terminal_chunk(error: EngineError) -> StreamChunk {
    StreamChunk {
        token: String::new(),
        text: String::new(),
        tokens_generated: 0,
        done: true,
        confidence: None,
        avg_confidence: None,
        needs_cloud_handoff: false,
        token_index: 0,
        stats: Some(edgerun_core::FinalStats {
            time_ms: 0,
            tokens_per_second: 0.0,
            stop_reason: edgerun_core::StopReason::Error,
        }),
        error: Some(error),
    }
}

fn dispatch(
    pending: &Mutex<HashMap<RequestId, Pending>>,
    pressure_tx: &broadcast::Sender<MemoryPressureReport>,
    progress_tx: &broadcast::Sender<(RequestId, InitProgress)>,
    frame: WorkerResponse,
) {
    match frame {
        WorkerResponse::Success { id, payload } => {
            match pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id) {
                Some(Pending::Unary(tx)) => {
                    let _ = tx.send(Ok(payload));
                }
                Some(Pending::Stream(_)) | None => {
                    tracing::warn!(id, "dropping terminal success with no matching pending entry");
                }
            }
        }
        WorkerResponse::Error { id, error } => {
            match pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id) {
                Some(entry) => fail_entry(entry, error),
                None => {
                    tracing::warn!(id, "dropping error response with no matching pending entry");
                }
            }
        }
        WorkerResponse::StreamChunk { id, chunk } => {
            let mut guard = pending.lock().unwrap_or_else(|e| e.into_inner());
            let done = chunk.done;
            match guard.get(&id) {
                Some(Pending::Stream(tx)) => {
                    let _ = tx.send(chunk);
                    if done {
                        guard.remove(&id);
                    }
                }
                Some(Pending::Unary(_)) | None => {
                    tracing::warn!(id, "dropping stream chunk with no matching stream entry");
                }
            }
        }
        WorkerResponse::Progress { id, progress } => {
            let _ = progress_tx.send((id, progress));
        }
        WorkerResponse::CancelAck { id, target } => {
            match pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id) {
                Some(Pending::Unary(tx)) => {
                    let _ = tx.send(Ok(ResponsePayload::CancelAcked { target }));
                }
                Some(Pending::Stream(_)) | None => {
                    // Best-effort timeout cleanup lands here by design.
                    tracing::debug!(id, target, "cancel acknowledged with no pending entry");
                }
            }
        }
        WorkerResponse::MemoryPressure { report } => {
            let _ = pressure_tx.send(report);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> (
        ProtocolClient,
        mpsc::UnboundedReceiver<WorkerRequest>,
        mpsc::UnboundedSender<WorkerResponse>,
    ) {
        let (to_worker, worker_rx) = mpsc::unbounded_channel();
        let (worker_tx, from_worker) = mpsc::unbounded_channel();
        let client = ProtocolClient::new(to_worker, from_worker, Duration::from_secs(300));
        (client, worker_rx, worker_tx)
    }

    #[tokio::test]
    async fn request_resolves_on_matching_id() {
        let (client, mut worker_rx, worker_tx) = client();

        let fut = client.request(|id| WorkerRequest::GetMemoryStats { id });
        let sent = worker_rx.recv().await.expect("request sent");
        let id = sent.id().expect("has id");

        // A response for a different id is logged and dropped.
        worker_tx
            .send(WorkerResponse::Success {
                id: id + 100,
                payload: ResponsePayload::ContextReset,
            })
            .expect("send");
        worker_tx
            .send(WorkerResponse::Success {
                id,
                payload: ResponsePayload::MemoryStats {
                    stats: MemoryStats::default(),
                },
            })
            .expect("send");

        match fut.await.expect("resolved") {
            ResponsePayload::MemoryStats { .. } => {}
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn ids_are_monotonic_within_the_channel() {
        let (client, mut worker_rx, worker_tx) = client();

        let fut_a = client.request(|id| WorkerRequest::GetMemoryStats { id });
        let fut_b = client.request(|id| WorkerRequest::GetModelInfo { id });
        let a = worker_rx.recv().await.expect("a").id().expect("id");
        let b = worker_rx.recv().await.expect("b").id().expect("id");
        assert!(b > a);

        for id in [a, b] {
            worker_tx
                .send(WorkerResponse::Success {
                    id,
                    payload: ResponsePayload::ContextReset,
                })
                .expect("send");
        }
        fut_a.await.expect("a resolves");
        fut_b.await.expect("b resolves");
    }

    #[tokio::test]
    async fn stream_chunks_route_until_done() {
        let (client, mut worker_rx, worker_tx) = client();

        let (id, mut chunks) = client
            .start_stream(|id| {
                WorkerRequest::GenerateStream {
                    id,
                    request: GenerationRequest::for_prompt("hi"),
                }
            })
            .expect("stream started");
        let _ = worker_rx.recv().await.expect("request sent");

        let mk = |token: &str, text: &str, index: u32, done: bool| StreamChunk {
            token: token.to_string(),
            text: text.to_string(),
            tokens_generated: index + 1,
            done,
            confidence: None,
            avg_confidence: None,
            needs_cloud_handoff: false,
            token_index: index,
            stats: None,
            error: None,
        };

        worker_tx
            .send(WorkerResponse::StreamChunk { id, chunk: mk("a", "a", 0, false) })
            .expect("send");
        worker_tx
            .send(WorkerResponse::StreamChunk { id, chunk: mk("b", "ab", 1, true) })
            .expect("send");

        assert_eq!(chunks.recv().await.expect("chunk").token, "a");
        let last = chunks.recv().await.expect("chunk");
        assert!(last.done);

        // Entry removed: a late chunk for the same id is dropped.
        worker_tx
            .send(WorkerResponse::StreamChunk { id, chunk: mk("c", "abc", 2, false) })
            .expect("send");
        tokio::task::yield_now().await;
        assert!(chunks.try_recv().is_err());
    }

    #[tokio::test]
    async fn protocol_error_becomes_error_terminal_chunk_for_streams() {
        let (client, mut worker_rx, worker_tx) = client();
        let (id, mut chunks) = client
            .start_stream(|id| {
                WorkerRequest::GenerateStream {
                    id,
                    request: GenerationRequest::for_prompt("hi"),
                }
            })
            .expect("stream started");
        let _ = worker_rx.recv().await.expect("request sent");

        worker_tx
            .send(WorkerResponse::Error {
                id,
                error: EngineError::new(ErrorKind::OutOfMemory, "oom"),
            })
            .expect("send");

        let chunk = chunks.recv().await.expect("terminal chunk");
        assert!(chunk.done);
        assert_eq!(chunk.error.as_ref().expect("error").kind, ErrorKind::OutOfMemory);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_rejects_and_fires_best_effort_cancel() {
        let (to_worker, mut worker_rx) = mpsc::unbounded_channel();
        let (_worker_tx, from_worker) = mpsc::unbounded_channel();
        let client = ProtocolClient::new(to_worker, from_worker, Duration::from_secs(5));

        let err = client
            .request(|id| WorkerRequest::GetMemoryStats { id })
            .await
            .expect_err("times out");
        assert_eq!(err.kind, ErrorKind::TimedOut);

        let original = worker_rx.recv().await.expect("original request");
        let follow_up = worker_rx.recv().await.expect("cancel follow-up");
        match follow_up {
            WorkerRequest::Cancel { target, .. } => {
                assert_eq!(Some(target), original.id());
            }
            other => panic!("expected cancel, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn worker_disappearing_fails_pending_with_disposed() {
        let (client, _worker_rx, worker_tx) = client();
        let fut = client.request(|id| WorkerRequest::GetMemoryStats { id });
        drop(worker_tx);

        let err = fut.await.expect_err("disposed");
        assert_eq!(err.kind, ErrorKind::Disposed);
    }

    #[tokio::test]
    async fn pressure_and_progress_fan_out() {
        let (client, _worker_rx, worker_tx) = client();
        let mut pressure = client.subscribe_pressure();
        let mut progress = client.subscribe_progress();

        worker_tx
            .send(WorkerResponse::MemoryPressure {
                report: MemoryPressureReport {
                    current_bytes: 900,
                    limit_bytes: 1000,
                    pressure_ratio: 0.9,
                    timestamp_ms: 1,
                },
            })
            .expect("send");
        worker_tx
            .send(WorkerResponse::Progress {
                id: 1,
                progress: InitProgress {
                    phase: InitPhase::Loading,
                    percent: 40,
                    detail: None,
                },
            })
            .expect("send");

        assert_eq!(pressure.recv().await.expect("report").limit_bytes, 1000);
        let (id, event) = progress.recv().await.expect("progress");
        assert_eq!(id, 1);
        assert_eq!(event.phase, InitPhase::Loading);
    }

    #[test]
    fn wire_frames_round_trip_as_tagged_json() {
        let request = WorkerRequest::DescribeFrame {
            id: 7,
            frame: FramePayload {
                rgb: vec![1, 2, 3],
                width: 1,
                height: 1,
            },
            prompt: "what is this".to_string(),
            request: GenerationRequest::for_prompt(""),
        };
        let json = serde_json::to_value(&request).expect("serialize");
        assert_eq!(json["type"], "describe_frame");
        // Binary payloads ride as base64 strings, not byte arrays.
        assert!(json["frame"]["rgb"].is_string());

        let back: WorkerRequest = serde_json::from_value(json).expect("deserialize");
        match back {
            WorkerRequest::DescribeFrame { frame, .. } => assert_eq!(frame.rgb, vec![1, 2, 3]),
            other => panic!("unexpected frame {other:?}"),
        }

        let response = WorkerResponse::Error {
            id: 7,
            error: EngineError::new(ErrorKind::Busy, "one request at a time"),
        };
        let json = serde_json::to_string(&response).expect("serialize");
        assert!(json.contains("\"type\":\"error\""));
        assert!(serde_json::from_str::<WorkerResponse>(&json).is_ok());

        // The enumerated frame types are closed: anything else fails to
        // decode instead of silently matching.
        assert!(serde_json::from_str::<WorkerResponse>(r#"{"type":"telepathy","id":1}"#).is_err());
        assert!(serde_json::from_str::<WorkerResponse>("not json at all").is_err());
    }
}
