//! Vision worker surfaces: one-shot frame description and queue-driven
//! frame processing over a persistent multimodal context.
//!
//! Frames are processed in enqueue order for the subset that is not
//! dropped; the dropped set is unordered and unrecoverable (see the frame
//! queue's drop policy).

use std::time::Instant;

use edgerun_core::{EngineError, ErrorKind, GenerationRequest};
use edgerun_supervisor::QosLevel;

use crate::protocol::{FrameDescription, FramePayload, FrameTimings, RequestId, ResponsePayload};
use crate::worker::{Worker, WorkerState, map_kernel_error};

impl Worker {
    pub(crate) fn handle_describe_frame(
        &mut self,
        id: RequestId,
        frame: FramePayload,
        prompt: &str,
        request: GenerationRequest,
    ) {
        if self.qos == Some(QosLevel::Paused) {
            self.fail(
                id,
                EngineError::new(ErrorKind::Busy, "workload is paused by policy"),
            );
            return;
        }
        match self.describe(&frame, prompt, &request) {
            Ok(description) => {
                self.success(id, ResponsePayload::FrameDescribed { description });
            }
            Err(err) => self.fail(id, err),
        }
    }

    pub(crate) fn handle_process_next_frame(
        &mut self,
        id: RequestId,
        prompt: &str,
        request: GenerationRequest,
    ) {
        let Some(queue) = self.options.frame_queue.clone() else {
            self.fail(
                id,
                EngineError::new(
                    ErrorKind::InvalidConfig,
                    "this worker has no frame queue attached",
                ),
            );
            return;
        };

        // Paused: leave the freshest frame waiting for restoration.
        if self.qos == Some(QosLevel::Paused) {
            self.success(id, ResponsePayload::NoFramePending);
            return;
        }

        let Some(frame) = queue.dequeue() else {
            self.success(id, ResponsePayload::NoFramePending);
            return;
        };

        let payload = FramePayload {
            rgb: frame.rgb,
            width: frame.width,
            height: frame.height,
        };
        let outcome = self.describe(&payload, prompt, &request);
        queue.mark_done();

        match outcome {
            Ok(description) => {
                self.success(id, ResponsePayload::FrameDescribed { description });
            }
            Err(err) => self.fail(id, err),
        }
    }

    fn describe(
        &mut self,
        frame: &FramePayload,
        prompt: &str,
        request: &GenerationRequest,
    ) -> Result<FrameDescription, EngineError> {
        if self.state != WorkerState::Ready {
            return Err(self.no_model_error());
        }
        request.validate()?;

        let expected = frame.width as usize * frame.height as usize * 3;
        if frame.rgb.len() != expected {
            return Err(EngineError::new(
                ErrorKind::InvalidConfig,
                format!(
                    "frame buffer is {} bytes but {}x{} rgb needs {expected}",
                    frame.rgb.len(),
                    frame.width,
                    frame.height
                ),
            ));
        }

        let mut params = request.sampling_params();
        params.max_tokens = self.clamped_max_tokens(request.max_tokens);

        self.state = WorkerState::Busy;
        let started = Instant::now();
        let outcome = match self.context.as_mut() {
            Some(context) => {
                context.describe_frame(&frame.rgb, frame.width, frame.height, prompt, &params)
            }
            None => {
                self.state = WorkerState::Ready;
                return Err(self.no_model_error());
            }
        };
        self.state = WorkerState::Ready;

        let (description, timings) = outcome.map_err(map_kernel_error)?;
        let total_ms = started.elapsed().as_millis() as u64;
        Ok(FrameDescription {
            description,
            timings: FrameTimings::from_vision(timings, total_ms),
        })
    }
}
