//! Message types flowing between the control handle and the worker thread.

use serde::Serialize;

/// A single prompt submitted for generation.
///
/// Consumed exactly once by the worker, in submission order.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Opaque caller-chosen identifier echoed on every chunk.
    pub id: u64,
    /// Monotonic submission number used by clear-queue bookkeeping.
    pub(crate) seq: u64,
}

impl GenerationRequest {
    pub(crate) fn new(prompt: String, id: u64, seq: u64) -> Self {
        Self { prompt, id, seq }
    }
}

/// One streamed output fragment, tagged with its request id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationChunk {
    pub text: String,
    pub id: u64,
}

/// What the worker pulls off its request queue.
#[derive(Debug)]
pub(crate) enum WorkerRequest {
    Generate(GenerationRequest),
    /// Sentinel: finish up and exit the loop.
    Stop,
}

/// Single-slot cancel signal. A second signal while one is pending is
/// dropped by the bounded channel, never queued.
#[derive(Debug)]
pub(crate) struct CancelSignal;

/// Single-slot clear signal.
///
/// Carries the submission high-water mark at the time of the call, so
/// requests enqueued after `clear_queue` returned are never discarded.
#[derive(Debug)]
pub(crate) struct ClearSignal {
    pub up_to_seq: u64,
}
