//! Inference worker.
//!
//! A dedicated thread owns the kernel context and processes protocol
//! requests one at a time. Streaming generation polls the request channel
//! between tokens so cancellation, memory-stats reads and policy updates
//! stay responsive while the kernel is busy; every other request arriving
//! mid-stream is refused with Busy.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use edgerun_core::{
    EngineConfig, EngineError, ErrorKind, FinalStats, GenerateResult, GenerationRequest,
    StopReason, StreamChunk,
};
use edgerun_kernel::{Backend, Kernel, KernelContext, KernelErrorCode};
use edgerun_supervisor::{FrameQueue, QosLevel};

use crate::protocol::{
    InitPhase, InitProgress, MemoryPressureReport, RequestId, ResponsePayload, WorkerRequest,
    WorkerResponse,
};
use crate::provider::ModelProvider;

/// Marker the kernel puts in context-exhaustion messages.
const CONTEXT_OVERFLOW_MARKER: &str = "context window";

pub(crate) struct WorkerOptions {
    /// Workload name this worker listens for in policy updates.
    pub(crate) name: String,
    /// Frame queue for vision workers.
    pub(crate) frame_queue: Option<Arc<FrameQueue>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerState {
    Spawned,
    Loading,
    Ready,
    Busy,
    Failed,
    Unloaded,
}

pub(crate) struct Worker {
    pub(crate) kernel: Arc<dyn Kernel>,
    pub(crate) provider: Arc<dyn ModelProvider>,
    pub(crate) rx: mpsc::UnboundedReceiver<WorkerRequest>,
    pub(crate) tx: mpsc::UnboundedSender<WorkerResponse>,
    pub(crate) options: WorkerOptions,
    pub(crate) state: WorkerState,
    pub(crate) context: Option<Box<dyn KernelContext>>,
    /// QoS level in force for new requests.
    pub(crate) qos: Option<QosLevel>,
    /// QoS update received mid-request; promoted at the next request.
    pub(crate) staged_qos: Option<QosLevel>,
    /// Requests deferred by a mid-stream abort, handled before the mailbox.
    pub(crate) deferred: VecDeque<WorkerRequest>,
}

/// Spawn a worker thread. Returns the request sender, the response receiver,
/// and the thread handle. Fails when the OS refuses a new thread.
pub(crate) fn spawn_worker(
    kernel: Arc<dyn Kernel>,
    provider: Arc<dyn ModelProvider>,
    options: WorkerOptions,
) -> Result<
    (
        mpsc::UnboundedSender<WorkerRequest>,
        mpsc::UnboundedReceiver<WorkerResponse>,
        std::thread::JoinHandle<()>,
    ),
    EngineError,
> {
    let (req_tx, req_rx) = mpsc::unbounded_channel();
    let (res_tx, res_rx) = mpsc::unbounded_channel();

    let thread_name = format!("edgerun-worker-{}", options.name);
    let worker = Worker {
        kernel,
        provider,
        rx: req_rx,
        tx: res_tx,
        options,
        state: WorkerState::Spawned,
        context: None,
        qos: None,
        staged_qos: None,
        deferred: VecDeque::new(),
    };

    let handle = std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || worker.run())
        .map_err(|err| {
            EngineError::new(ErrorKind::GenerationFailed, "failed to spawn worker thread")
                .with_details(err.to_string())
        })?;

    Ok((req_tx, res_rx, handle))
}

enum Drained {
    /// Nothing actionable; keep streaming.
    Idle,
    /// The current request was cancelled.
    CancelCurrent,
    /// A context-invalidating request arrived; the stream must die and the
    /// request runs afterwards.
    Abort(WorkerRequest),
    /// The host hung up.
    HostGone,
}

impl Worker {
    fn run(mut self) {
        loop {
            let request = match self.deferred.pop_front() {
                Some(request) => request,
                None => match self.rx.blocking_recv() {
                    Some(request) => request,
                    None => break,
                },
            };
            if !self.handle(request) {
                break;
            }
        }
        tracing::debug!(worker = %self.options.name, "worker thread exiting");
    }

    pub(crate) fn send(&self, response: WorkerResponse) {
        let _ = self.tx.send(response);
    }

    pub(crate) fn success(&self, id: RequestId, payload: ResponsePayload) {
        self.send(WorkerResponse::Success { id, payload });
    }

    pub(crate) fn fail(&self, id: RequestId, error: EngineError) {
        self.send(WorkerResponse::Error { id, error });
    }

    fn progress(&self, id: RequestId, phase: InitPhase, percent: u8, detail: Option<String>) {
        self.send(WorkerResponse::Progress {
            id,
            progress: InitProgress {
                phase,
                percent,
                detail,
            },
        });
    }

    /// Promote a staged policy update. Called at the start of every new
    /// request, never mid-stream.
    fn promote_policy(&mut self) {
        if let Some(qos) = self.staged_qos.take() {
            self.qos = Some(qos);
        }
    }

    /// Token budget after the QoS envelope clamp.
    pub(crate) fn clamped_max_tokens(&self, requested: u32) -> u32 {
        match self.qos {
            Some(level) => requested.min(level.envelope().max_tokens),
            None => requested,
        }
    }

    pub(crate) fn no_model_error(&self) -> EngineError {
        match self.state {
            WorkerState::Failed => EngineError::new(
                ErrorKind::GenerationFailed,
                "worker is in a failed state; free it and spawn a new one",
            ),
            _ => EngineError::new(ErrorKind::InvalidConfig, "no model is loaded"),
        }
    }

    /// Handle one request. Returns false when the worker should exit.
    fn handle(&mut self, request: WorkerRequest) -> bool {
        match request {
            WorkerRequest::Init { id, config } => {
                self.promote_policy();
                self.handle_init(id, config);
            }
            WorkerRequest::Generate { id, request } => {
                self.promote_policy();
                self.handle_generate(id, request, false);
            }
            WorkerRequest::GenerateStream { id, request } => {
                self.promote_policy();
                self.handle_generate(id, request, true);
            }
            WorkerRequest::Cancel { id, target } => {
                // Nothing in flight: acknowledge and move on.
                self.send(WorkerResponse::CancelAck { id, target });
            }
            WorkerRequest::GetMemoryStats { id } => self.respond_memory_stats(id),
            WorkerRequest::GetModelInfo { id } => self.respond_model_info(id),
            WorkerRequest::ResetContext { id } => match self.context.as_mut() {
                Some(ctx) => match ctx.reset_context() {
                    Ok(()) => self.success(id, ResponsePayload::ContextReset),
                    Err(err) => self.fail(id, err.into()),
                },
                None => self.fail(id, self.no_model_error()),
            },
            WorkerRequest::UnloadModel { id } => {
                self.context = None;
                self.state = WorkerState::Unloaded;
                self.success(id, ResponsePayload::Unloaded);
            }
            WorkerRequest::Free { id } => {
                self.context = None;
                self.success(id, ResponsePayload::Freed);
                return false;
            }
            WorkerRequest::DescribeFrame {
                id,
                frame,
                prompt,
                request,
            } => {
                self.promote_policy();
                self.handle_describe_frame(id, frame, &prompt, request);
            }
            WorkerRequest::ProcessNextFrame {
                id,
                prompt,
                request,
            } => {
                self.promote_policy();
                self.handle_process_next_frame(id, &prompt, request);
            }
            WorkerRequest::Embed { id, .. } => {
                self.fail(
                    id,
                    EngineError::new(
                        ErrorKind::GenerationFailed,
                        "this kernel does not implement embedding",
                    )
                    .with_hint("use an embedding pipeline library on the host"),
                );
            }
            WorkerRequest::PolicyUpdate { qos_by_workload } => {
                if let Some(level) = qos_by_workload.get(&self.options.name) {
                    self.staged_qos = Some(*level);
                }
            }
        }
        true
    }

    fn respond_memory_stats(&self, id: RequestId) {
        match self.context.as_ref() {
            Some(ctx) => match ctx.memory_stats() {
                Ok(stats) => self.success(id, ResponsePayload::MemoryStats { stats }),
                Err(err) => self.fail(id, err.into()),
            },
            None => self.fail(id, self.no_model_error()),
        }
    }

    fn respond_model_info(&self, id: RequestId) {
        match self.context.as_ref() {
            Some(ctx) => match ctx.model_info() {
                Ok(info) => self.success(id, ResponsePayload::ModelInfo { info }),
                Err(err) => self.fail(id, err.into()),
            },
            None => self.fail(id, self.no_model_error()),
        }
    }

    fn handle_init(&mut self, id: RequestId, config: EngineConfig) {
        match self.state {
            WorkerState::Spawned | WorkerState::Unloaded => {}
            WorkerState::Failed => {
                self.fail(id, self.no_model_error());
                return;
            }
            _ => {
                self.fail(
                    id,
                    EngineError::new(ErrorKind::InvalidConfig, "worker is already initialized"),
                );
                return;
            }
        }

        if let Err(err) = config.validate() {
            self.fail(id, err);
            return;
        }

        let backend = match config.device {
            edgerun_core::DeviceHint::Gpu => {
                if !self.kernel.gpu_available() {
                    self.fail(
                        id,
                        EngineError::new(
                            ErrorKind::UnsupportedBackend,
                            "GPU was requested explicitly but no GPU backend is available",
                        )
                        .with_hint("use device \"auto\" or \"cpu\""),
                    );
                    return;
                }
                Backend::Gpu
            }
            edgerun_core::DeviceHint::Cpu => Backend::Cpu,
            edgerun_core::DeviceHint::Auto => {
                let detected = self.kernel.detect_backend();
                if detected == Backend::Cpu {
                    tracing::info!("no GPU backend available; falling back to CPU");
                }
                detected
            }
        };

        self.state = WorkerState::Loading;
        self.progress(id, InitPhase::Downloading, 0, None);

        let tx = self.tx.clone();
        let mut report = |progress: InitProgress| {
            let _ = tx.send(WorkerResponse::Progress { id, progress });
        };
        let bytes = match self.provider.fetch(&config.model_id, &mut report) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.state = WorkerState::Failed;
                self.fail(id, err);
                return;
            }
        };

        self.progress(id, InitPhase::Loading, 99, None);

        let kernel_config = config.kernel_config(backend);
        let mut context = match self
            .kernel
            .init(&kernel_config, &bytes.model, bytes.projector.as_deref())
        {
            Ok(context) => context,
            Err(err) => {
                self.state = WorkerState::Failed;
                self.fail(id, err.into());
                return;
            }
        };

        // The declared context length must fit what the kernel loaded.
        match context.model_info() {
            Ok(info) => {
                if info.trained_context_length > 0
                    && config.max_context_length > info.trained_context_length
                {
                    self.state = WorkerState::Failed;
                    self.fail(
                        id,
                        EngineError::new(
                            ErrorKind::InvalidConfig,
                            format!(
                                "max_context_length {} exceeds the model's context of {}",
                                config.max_context_length, info.trained_context_length
                            ),
                        ),
                    );
                    return;
                }
            }
            Err(err) => {
                self.state = WorkerState::Failed;
                self.fail(id, err.into());
                return;
            }
        }

        let pressure_tx = self.tx.clone();
        context.set_memory_pressure_callback(Box::new(move |current_bytes, limit_bytes| {
            let _ = pressure_tx.send(WorkerResponse::MemoryPressure {
                report: MemoryPressureReport {
                    current_bytes,
                    limit_bytes,
                    pressure_ratio: if limit_bytes > 0 {
                        current_bytes as f64 / limit_bytes as f64
                    } else {
                        0.0
                    },
                    timestamp_ms: chrono::Utc::now().timestamp_millis(),
                },
            });
        }));

        let backend_name = context.backend().name().to_string();
        self.context = Some(context);
        self.state = WorkerState::Ready;
        self.progress(id, InitPhase::Ready, 100, None);
        self.success(id, ResponsePayload::Ready { backend: backend_name });
    }

    fn handle_generate(&mut self, id: RequestId, request: GenerationRequest, streaming: bool) {
        if self.state != WorkerState::Ready {
            self.fail(id, self.no_model_error());
            return;
        }
        if let Err(err) = request.validate() {
            self.fail(id, err);
            return;
        }

        self.state = WorkerState::Busy;
        let outcome = self.run_generation(id, &request, streaming);
        if self.state == WorkerState::Busy {
            self.state = WorkerState::Ready;
        }

        match outcome {
            GenerationOutcome::Streamed => {}
            GenerationOutcome::Finished(result) => {
                self.success(id, ResponsePayload::Generated { result });
            }
            GenerationOutcome::Failed(err) => self.fail(id, err),
        }
    }

    /// Run the token loop. For streams, chunks (including the terminal one)
    /// are emitted as they form; for blocking requests the reduced result is
    /// returned instead.
    fn run_generation(
        &mut self,
        id: RequestId,
        request: &GenerationRequest,
        streaming: bool,
    ) -> GenerationOutcome {
        let started = Instant::now();
        let max_tokens = self.clamped_max_tokens(request.max_tokens);
        let mut progress = StreamProgress::new(request.confidence_threshold);

        // maxTokens 0 never touches the kernel: one terminal chunk.
        if max_tokens == 0 {
            return self.finish_stream(id, progress, started, StopReason::MaxTokens, streaming);
        }

        let Some(context) = self.context.as_mut() else {
            return GenerationOutcome::Failed(self.no_model_error());
        };

        let params = {
            let mut params = request.sampling_params();
            params.max_tokens = max_tokens;
            params
        };
        let mut stream = match context.open_stream(&request.prompt, &params) {
            Ok(stream) => stream,
            Err(err) => return GenerationOutcome::Failed(map_kernel_error(err)),
        };

        loop {
            match self.drain_control(id) {
                Drained::Idle => {}
                Drained::CancelCurrent | Drained::HostGone => {
                    stream.cancel();
                    drop(stream);
                    return self.finish_stream(
                        id,
                        progress,
                        started,
                        StopReason::Cancelled,
                        streaming,
                    );
                }
                Drained::Abort(deferred) => {
                    stream.cancel();
                    drop(stream);
                    self.deferred.push_back(deferred);
                    progress.error = Some(EngineError::new(
                        ErrorKind::GenerationFailed,
                        "context invalidated while streaming",
                    ));
                    return self.finish_stream(id, progress, started, StopReason::Error, streaming);
                }
            }

            let token = match stream.next_token() {
                Ok(Some(token)) => token,
                Ok(None) => {
                    drop(stream);
                    return self.finish_stream(
                        id,
                        progress,
                        started,
                        StopReason::MaxTokens,
                        streaming,
                    );
                }
                Err(err) => {
                    drop(stream);
                    progress.error = Some(map_kernel_error(err));
                    return self.finish_stream(id, progress, started, StopReason::Error, streaming);
                }
            };

            let stopped = progress.push_token(&token.bytes, token.confidence, &request.stop_sequences);
            if streaming {
                self.send(WorkerResponse::StreamChunk {
                    id,
                    chunk: progress.chunk(),
                });
            }

            if stopped {
                stream.cancel();
                drop(stream);
                return self.finish_stream(
                    id,
                    progress,
                    started,
                    StopReason::StopSequence,
                    streaming,
                );
            }
            if progress.tokens_generated >= max_tokens {
                drop(stream);
                return self.finish_stream(id, progress, started, StopReason::MaxTokens, streaming);
            }
        }
    }

    fn finish_stream(
        &mut self,
        id: RequestId,
        progress: StreamProgress,
        started: Instant,
        stop_reason: StopReason,
        streaming: bool,
    ) -> GenerationOutcome {
        let time_ms = started.elapsed().as_millis() as u64;
        let elapsed_s = started.elapsed().as_secs_f64();
        let tokens_per_second = if elapsed_s > 0.0 {
            f64::from(progress.tokens_generated) / elapsed_s
        } else {
            0.0
        };
        let stats = FinalStats {
            time_ms,
            tokens_per_second,
            stop_reason,
        };

        if streaming {
            let mut chunk = StreamChunk::terminal(
                progress.text.clone(),
                progress.tokens_generated,
                stats,
                progress.avg_confidence(),
                progress.needs_cloud_handoff,
            );
            chunk.error = progress.error.clone();
            self.send(WorkerResponse::StreamChunk { id, chunk });
            return GenerationOutcome::Streamed;
        }

        if let Some(error) = progress.error {
            return GenerationOutcome::Failed(error);
        }
        GenerationOutcome::Finished(GenerateResult {
            text: progress.text,
            tokens_generated: progress.tokens_generated,
            time_ms,
            tokens_per_second,
            stopped: stop_reason != StopReason::MaxTokens,
            stop_reason,
        })
    }

    /// Service the mailbox between tokens without leaving the stream.
    fn drain_control(&mut self, current: RequestId) -> Drained {
        loop {
            match self.rx.try_recv() {
                Err(mpsc::error::TryRecvError::Empty) => return Drained::Idle,
                Err(mpsc::error::TryRecvError::Disconnected) => return Drained::HostGone,
                Ok(WorkerRequest::Cancel { id, target }) => {
                    self.send(WorkerResponse::CancelAck { id, target });
                    if target == current {
                        return Drained::CancelCurrent;
                    }
                }
                Ok(WorkerRequest::GetMemoryStats { id }) => self.respond_memory_stats(id),
                Ok(WorkerRequest::GetModelInfo { id }) => self.respond_model_info(id),
                Ok(WorkerRequest::PolicyUpdate { qos_by_workload }) => {
                    if let Some(level) = qos_by_workload.get(&self.options.name) {
                        self.staged_qos = Some(*level);
                    }
                }
                Ok(
                    request @ (WorkerRequest::ResetContext { .. }
                    | WorkerRequest::UnloadModel { .. }
                    | WorkerRequest::Free { .. }),
                ) => return Drained::Abort(request),
                Ok(other) => {
                    if let Some(id) = other.id() {
                        self.fail(
                            id,
                            EngineError::new(
                                ErrorKind::Busy,
                                "a kernel request is already in flight",
                            ),
                        );
                    }
                }
            }
        }
    }
}

enum GenerationOutcome {
    /// Chunks (terminal included) already went out.
    Streamed,
    /// Blocking result.
    Finished(GenerateResult),
    /// Blocking failure (or pre-stream failure).
    Failed(EngineError),
}

/// Map kernel failures to host error kinds, recognizing context exhaustion.
pub(crate) fn map_kernel_error(err: edgerun_kernel::KernelError) -> EngineError {
    if err.code == KernelErrorCode::InferenceFailed
        && err.message.contains(CONTEXT_OVERFLOW_MARKER)
    {
        return EngineError::new(ErrorKind::ContextOverflow, err.message)
            .with_hint("resetContext");
    }
    err.into()
}

/// Reassembles token byte payloads into complete UTF-8 text.
///
/// Tokens may split multi-byte sequences; bytes are buffered until a whole
/// code point forms, so emitted text never contains a partial sequence.
#[derive(Debug, Default)]
pub(crate) struct Utf8Assembler {
    pending: Vec<u8>,
}

impl Utf8Assembler {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    out.push_str(valid);
                    self.pending.clear();
                    return out;
                }
                Err(err) => {
                    let valid_len = err.valid_up_to();
                    out.push_str(
                        std::str::from_utf8(&self.pending[..valid_len]).unwrap_or_default(),
                    );
                    match err.error_len() {
                        // Truly invalid bytes are replaced, not dropped.
                        Some(bad) => {
                            out.push('\u{FFFD}');
                            self.pending.drain(..valid_len + bad);
                        }
                        // Incomplete trailing sequence: keep it buffered.
                        None => {
                            self.pending.drain(..valid_len);
                            return out;
                        }
                    }
                }
            }
        }
    }
}

/// Accumulated state of one generation.
struct StreamProgress {
    assembler: Utf8Assembler,
    text: String,
    tokens_generated: u32,
    last_token_text: String,
    last_confidence: Option<f32>,
    confidence_sum: f64,
    confidence_count: u32,
    confidence_threshold: Option<f32>,
    needs_cloud_handoff: bool,
    error: Option<EngineError>,
}

impl StreamProgress {
    fn new(confidence_threshold: Option<f32>) -> Self {
        Self {
            assembler: Utf8Assembler::default(),
            text: String::new(),
            tokens_generated: 0,
            last_token_text: String::new(),
            last_confidence: None,
            confidence_sum: 0.0,
            confidence_count: 0,
            confidence_threshold: None,
            needs_cloud_handoff: false,
            error: None,
        }
        .with_threshold(confidence_threshold)
    }

    fn with_threshold(mut self, threshold: Option<f32>) -> Self {
        self.confidence_threshold = threshold.filter(|t| *t > 0.0);
        self
    }

    fn avg_confidence(&self) -> Option<f32> {
        (self.confidence_count > 0)
            .then(|| (self.confidence_sum / f64::from(self.confidence_count)) as f32)
    }

    /// Fold one kernel token in. Returns true when a stop sequence matched.
    fn push_token(
        &mut self,
        bytes: &[u8],
        confidence: Option<f32>,
        stop_sequences: &[String],
    ) -> bool {
        let addition = self.assembler.push(bytes);
        self.tokens_generated += 1;
        self.text.push_str(&addition);
        self.last_token_text = addition;

        self.last_confidence = confidence;
        if let Some(confidence) = confidence {
            self.confidence_sum += f64::from(confidence);
            self.confidence_count += 1;
            if let (Some(threshold), Some(avg)) = (self.confidence_threshold, self.avg_confidence())
            {
                // Sticky once crossed.
                if avg < threshold {
                    self.needs_cloud_handoff = true;
                }
            }
        }

        if let Some(end) = find_stop_sequence(&self.text, self.last_token_text.len(), stop_sequences)
        {
            // Trim everything past the matched sequence so the cumulative
            // text ends exactly at the stop.
            let prev_len = self.text.len() - self.last_token_text.len();
            self.text.truncate(end);
            self.last_token_text = self.text[prev_len.min(end)..].to_string();
            return true;
        }
        false
    }

    /// Non-terminal chunk for the most recent token.
    fn chunk(&self) -> StreamChunk {
        StreamChunk {
            token: self.last_token_text.clone(),
            text: self.text.clone(),
            tokens_generated: self.tokens_generated,
            done: false,
            confidence: self.last_confidence,
            avg_confidence: self.avg_confidence(),
            needs_cloud_handoff: self.needs_cloud_handoff,
            token_index: self.tokens_generated.saturating_sub(1),
            stats: None,
            error: None,
        }
    }
}

/// Find the first stop sequence (in declaration order) inside the tail of
/// the cumulative text that the last token could have completed. Returns the
/// byte offset just past the match.
fn find_stop_sequence(text: &str, addition_len: usize, stop_sequences: &[String]) -> Option<usize> {
    for stop in stop_sequences {
        if stop.is_empty() {
            continue;
        }
        // A match must involve the new bytes, but may straddle the token
        // boundary: widen the window by the stop length.
        let mut window_start = text.len().saturating_sub(addition_len + stop.len());
        while window_start > 0 && !text.is_char_boundary(window_start) {
            window_start -= 1;
        }
        if let Some(pos) = text[window_start..].find(stop.as_str()) {
            return Some(window_start + pos + stop.len());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_assembler_buffers_split_code_points() {
        let mut assembler = Utf8Assembler::default();
        // "€" = E2 82 AC split across three pushes.
        assert_eq!(assembler.push(&[0xE2]), "");
        assert_eq!(assembler.push(&[0x82]), "");
        assert_eq!(assembler.push(&[0xAC]), "€");

        // Mixed: complete ASCII followed by a partial sequence.
        assert_eq!(assembler.push(b"ok\xF0\x9F"), "ok");
        assert_eq!(assembler.push(b"\x99\x82!"), "🙂!");
    }

    #[test]
    fn utf8_assembler_replaces_invalid_bytes() {
        let mut assembler = Utf8Assembler::default();
        assert_eq!(assembler.push(b"a\xFFb"), "a\u{FFFD}b");
    }

    #[test]
    fn stop_sequence_matches_across_token_boundaries() {
        // "STOP" split as "...S" + "TOP..." must still match.
        let stops = vec!["STOP".to_string()];

        let text = "hello S";
        assert_eq!(find_stop_sequence(text, 1, &stops), None);

        let text = "hello STOP and more";
        // Last token appended "TOP and more" (12 bytes).
        let end = find_stop_sequence(text, 12, &stops).expect("match");
        assert_eq!(&text[..end], "hello STOP");
    }

    #[test]
    fn stop_sequences_are_checked_in_declaration_order() {
        let stops = vec!["ab".to_string(), "b".to_string()];
        let text = "xxab";
        let end = find_stop_sequence(text, 4, &stops).expect("match");
        assert_eq!(&text[..end], "xxab");
    }

    #[test]
    fn stop_window_respects_char_boundaries() {
        let stops = vec!["!".to_string()];
        let text = "héllo🙂!";
        let end = find_stop_sequence(text, 5, &stops).expect("match");
        assert_eq!(end, text.len());
    }

    #[test]
    fn progress_tracks_confidence_and_sticky_handoff() {
        let mut progress = StreamProgress::new(Some(0.8));
        progress.push_token(b"a", Some(0.9), &[]);
        assert!(!progress.needs_cloud_handoff);

        progress.push_token(b"b", Some(0.5), &[]);
        // Average 0.7 < 0.8: handoff trips.
        assert!(progress.needs_cloud_handoff);

        // And stays tripped even if confidence recovers.
        progress.push_token(b"c", Some(1.0), &[]);
        assert!(progress.needs_cloud_handoff);
        let avg = progress.avg_confidence().expect("avg");
        assert!((avg - 0.8).abs() < 1e-6);
    }

    #[test]
    fn truncation_after_stop_keeps_prefix_invariant() {
        let mut progress = StreamProgress::new(None);
        let stops = vec!["END".to_string()];
        assert!(!progress.push_token(b"hello E", None, &stops));
        let before = progress.text.clone();
        assert!(progress.push_token(b"ND trailing junk", None, &stops));
        assert_eq!(progress.text, "hello END");
        assert!(progress.text.starts_with(&before));
        assert_eq!(progress.chunk().token, "ND");
    }

    #[test]
    fn kernel_context_errors_map_to_context_overflow() {
        let err = edgerun_kernel::KernelError::new(
            KernelErrorCode::InferenceFailed,
            "context window exhausted: need 900 tokens, 512 available",
        );
        let mapped = map_kernel_error(err);
        assert_eq!(mapped.kind, ErrorKind::ContextOverflow);
        assert_eq!(mapped.hint.as_deref(), Some("resetContext"));

        let other = edgerun_kernel::KernelError::new(KernelErrorCode::InferenceFailed, "boom");
        assert_eq!(map_kernel_error(other).kind, ErrorKind::GenerationFailed);
    }
}
