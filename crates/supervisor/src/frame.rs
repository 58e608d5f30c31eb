//! Single-slot drop-newest frame queue.
//!
//! Couples a continuous producer (camera) to a worker that cannot keep up,
//! without unbounded queueing: at most one frame waits, at most one frame is
//! in flight, and the producer is never blocked.
//!
//! Drop policy: an enqueue that observes a non-empty pending slot replaces
//! the waiting frame and counts a drop, whether or not a frame is currently
//! being processed. The replaced frame is the one dropped; the freshest frame
//! always wins.

use std::sync::Mutex;

use edgerun_core::{EngineError, ErrorKind};

/// One RGB frame. Owned by the queue until dequeued, then by the worker
/// until it marks processing done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Packed RGB bytes, `width * height * 3` long.
    pub rgb: Vec<u8>,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Frame {
    /// Build a frame, rejecting mismatched buffer lengths.
    pub fn new(rgb: Vec<u8>, width: u32, height: u32) -> Result<Self, EngineError> {
        let expected = width as usize * height as usize * 3;
        if rgb.len() != expected {
            return Err(EngineError::new(
                ErrorKind::InvalidConfig,
                format!(
                    "frame buffer is {} bytes but {width}x{height} rgb needs {expected}",
                    rgb.len()
                ),
            ));
        }
        Ok(Self { rgb, width, height })
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: Option<Frame>,
    processing: bool,
    dropped: u64,
}

/// Capacity-1 drop-newest queue with a processing flag and drop counter.
#[derive(Debug, Default)]
pub struct FrameQueue {
    state: Mutex<QueueState>,
}

impl FrameQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a frame. Returns `true` when a previously pending frame was
    /// replaced (and counted as dropped).
    pub fn enqueue(&self, frame: Frame) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let dropped = state.pending.is_some();
        if dropped {
            state.dropped += 1;
        }
        state.pending = Some(frame);
        dropped
    }

    /// Take the pending frame, marking the queue as processing. `None` when
    /// nothing is waiting.
    pub fn dequeue(&self) -> Option<Frame> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let frame = state.pending.take()?;
        state.processing = true;
        Some(frame)
    }

    /// Clear the processing flag after the dequeued frame is handled.
    pub fn mark_done(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.processing = false;
    }

    /// Drop any pending frame and clear the processing flag. The drop
    /// counter is preserved.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.pending = None;
        state.processing = false;
    }

    /// Zero the drop counter.
    pub fn reset_counters(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.dropped = 0;
    }

    /// Number of frames replaced while waiting.
    pub fn dropped_count(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).dropped
    }

    /// Whether a dequeued frame has not been marked done yet.
    pub fn is_processing(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .processing
    }

    /// Whether a frame is waiting.
    pub fn has_pending(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8) -> Frame {
        Frame::new(vec![tag; 3], 1, 1).expect("frame")
    }

    #[test]
    fn frame_length_is_validated() {
        assert!(Frame::new(vec![0; 12], 2, 2).is_ok());
        let err = Frame::new(vec![0; 11], 2, 2).expect_err("short buffer");
        assert_eq!(err.kind, ErrorKind::InvalidConfig);
    }

    #[test]
    fn enqueue_into_empty_slot_is_not_a_drop() {
        let queue = FrameQueue::new();
        assert!(!queue.enqueue(frame(1)));
        assert_eq!(queue.dropped_count(), 0);
    }

    #[test]
    fn replacement_counts_a_drop_regardless_of_processing() {
        let queue = FrameQueue::new();

        // Not processing: second enqueue still replaces and counts.
        queue.enqueue(frame(1));
        assert!(queue.enqueue(frame(2)));
        assert_eq!(queue.dropped_count(), 1);
        assert_eq!(queue.dequeue(), Some(frame(2)));

        // Processing: same policy.
        queue.enqueue(frame(3));
        assert!(queue.enqueue(frame(4)));
        assert_eq!(queue.dropped_count(), 2);
    }

    #[test]
    fn at_most_one_frame_pending_and_one_in_flight() {
        let queue = FrameQueue::new();
        for tag in 0..100 {
            queue.enqueue(frame(tag));
        }
        assert_eq!(queue.dropped_count(), 99);

        // Only the newest frame survived.
        assert_eq!(queue.dequeue(), Some(frame(99)));
        assert!(queue.is_processing());
        assert_eq!(queue.dequeue(), None);

        queue.mark_done();
        assert!(!queue.is_processing());
    }

    #[test]
    fn dropped_count_equals_enqueues_that_saw_an_occupied_slot() {
        let queue = FrameQueue::new();
        let mut expected = 0u64;
        for round in 0..10u8 {
            for tag in 0..5u8 {
                if queue.has_pending() {
                    expected += 1;
                }
                queue.enqueue(frame(round * 5 + tag));
            }
            queue.dequeue();
            queue.mark_done();
        }
        assert_eq!(queue.dropped_count(), expected);
    }

    #[test]
    fn reset_preserves_the_drop_counter() {
        let queue = FrameQueue::new();
        queue.enqueue(frame(1));
        queue.enqueue(frame(2));
        queue.dequeue();

        queue.reset();
        assert!(!queue.is_processing());
        assert!(!queue.has_pending());
        assert_eq!(queue.dropped_count(), 1);

        queue.reset_counters();
        assert_eq!(queue.dropped_count(), 0);
    }
}
