//! Adaptive jitter buffer for upsampled audio chunks
//!
//! This is the only state shared between the network context and the
//! real-time audio context. It is a single-producer single-consumer queue:
//! the network side only pushes (and adds to `queued_samples`), the audio side
//! only pops (and subtracts). Flushes are performed by the producer popping
//! everything itself, so the audio thread is never asked to wait.
//!
//! All sample counts here are interleaved `f32` values, two per stereo frame.

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::constants::{DEPTH_HISTORY_LEN, EXTREME_OVERRUN_CHUNKS, OUTPUT_CHANNELS, QUEUE_CAPACITY};

/// Interleaved stereo samples at the output device's native rate
///
/// Produced once by the upsampler and consumed once by the pull engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    samples: Vec<f32>,
}

impl Chunk {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Number of interleaved samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of stereo frames
    pub fn frames(&self) -> usize {
        self.samples.len() / OUTPUT_CHANNELS
    }
}

/// What happened to a pushed chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Chunk appended
    Queued,
    /// Queue exceeded its hard limit and everything was discarded
    ExtremeOverrun { dropped_chunks: usize },
}

/// Fixed-length circular history of queue depths
struct DepthHistory {
    slots: Vec<usize>,
    next: usize,
    filled: usize,
}

impl DepthHistory {
    fn new(len: usize) -> Self {
        Self {
            slots: vec![0; len.max(1)],
            next: 0,
            filled: 0,
        }
    }

    fn record(&mut self, depth: usize) {
        self.slots[self.next] = depth;
        self.next = (self.next + 1) % self.slots.len();
        self.filled = (self.filled + 1).min(self.slots.len());
    }

    /// Peak-to-trough spread of the recorded depths
    fn spread(&self) -> usize {
        let recorded = &self.slots[..self.filled];
        let max = recorded.iter().copied().max().unwrap_or(0);
        let min = recorded.iter().copied().min().unwrap_or(0);
        max - min
    }

    fn clear(&mut self) {
        self.next = 0;
        self.filled = 0;
    }
}

/// Display-oriented view of the buffer
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BufferStatus {
    /// Occupancy as a multiple of the target, clamped to 0..=2
    pub buffered_fraction: f64,
    /// Target depth expressed as playback time
    pub target_latency_seconds: f64,
}

/// Counters for logging
#[derive(Debug, Clone, Default)]
pub struct BufferStats {
    pub queued_chunks: usize,
    pub queued_samples: usize,
    pub target_queue_size: Option<usize>,
    pub chunks_pushed: u64,
    pub chunks_popped: u64,
    pub extreme_overruns: u64,
}

/// Chunk FIFO plus adaptive target-size controller
pub struct JitterBuffer {
    queue: ArrayQueue<Chunk>,
    queued_samples: AtomicUsize,
    /// Zero until the first chunk has been seen
    target_queue_size: AtomicUsize,
    last_input_chunk_len: AtomicUsize,
    last_output_chunk_len: AtomicUsize,
    flush_pending: AtomicBool,
    /// Only locked by the audio context
    history: Mutex<DepthHistory>,
    chunks_pushed: AtomicU64,
    chunks_popped: AtomicU64,
    extreme_overruns: AtomicU64,
}

impl JitterBuffer {
    pub fn new() -> Self {
        Self {
            queue: ArrayQueue::new(QUEUE_CAPACITY),
            queued_samples: AtomicUsize::new(0),
            target_queue_size: AtomicUsize::new(0),
            last_input_chunk_len: AtomicUsize::new(0),
            last_output_chunk_len: AtomicUsize::new(0),
            flush_pending: AtomicBool::new(false),
            history: Mutex::new(DepthHistory::new(DEPTH_HISTORY_LEN)),
            chunks_pushed: AtomicU64::new(0),
            chunks_popped: AtomicU64::new(0),
            extreme_overruns: AtomicU64::new(0),
        }
    }

    /// Append a chunk (network context only)
    pub fn push(&self, chunk: Chunk) -> PushOutcome {
        let len = chunk.len();
        self.last_input_chunk_len.store(len, Ordering::Relaxed);

        // Count before publishing so the consumer never subtracts first
        self.queued_samples.fetch_add(len, Ordering::AcqRel);
        if let Err(rejected) = self.queue.push(chunk) {
            self.queued_samples.fetch_sub(rejected.len(), Ordering::AcqRel);
            return self.extreme_overrun();
        }
        self.chunks_pushed.fetch_add(1, Ordering::Relaxed);

        if self.queue.len() > EXTREME_OVERRUN_CHUNKS {
            return self.extreme_overrun();
        }
        PushOutcome::Queued
    }

    fn extreme_overrun(&self) -> PushOutcome {
        let dropped_chunks = self.drain();
        self.extreme_overruns.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("Extreme overrun: dropped {} buffered chunks", dropped_chunks);
        PushOutcome::ExtremeOverrun { dropped_chunks }
    }

    /// Pop the oldest chunk (audio context only)
    pub fn pop(&self) -> Option<Chunk> {
        let chunk = self.queue.pop()?;
        self.queued_samples.fetch_sub(chunk.len(), Ordering::AcqRel);
        self.chunks_popped.fetch_add(1, Ordering::Relaxed);
        Some(chunk)
    }

    fn drain(&self) -> usize {
        let mut dropped = 0;
        while let Some(chunk) = self.queue.pop() {
            self.queued_samples.fetch_sub(chunk.len(), Ordering::AcqRel);
            dropped += 1;
        }
        dropped
    }

    /// Discard all buffered audio, including the chunk the consumer is
    /// currently draining (network context only)
    pub fn flush(&self) -> usize {
        let dropped = self.drain();
        self.flush_pending.store(true, Ordering::Release);
        dropped
    }

    /// Consume a pending flush request (audio context)
    pub fn take_flush_request(&self) -> bool {
        self.flush_pending.swap(false, Ordering::AcqRel)
    }

    pub fn queued_samples(&self) -> usize {
        self.queued_samples.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Current target depth, `None` before any chunk has been seen
    pub fn target_queue_size(&self) -> Option<usize> {
        match self.target_queue_size.load(Ordering::Acquire) {
            0 => None,
            n => Some(n),
        }
    }

    /// Size of the most recent output request, in interleaved samples
    pub fn note_output_chunk_len(&self, len: usize) {
        self.last_output_chunk_len.store(len, Ordering::Relaxed);
    }

    /// Record the current depth and recompute the target (once per callback)
    pub fn record_depth_sample(&self) -> Option<usize> {
        self.record_depth(self.queued_samples())
    }

    /// Record `depth` and recompute the target.
    ///
    /// target = max(1, (max(history) - min(history)) + max(last input, last output chunk))
    pub fn record_depth(&self, depth: usize) -> Option<usize> {
        let spread = {
            let mut history = self.history.lock();
            history.record(depth);
            history.spread()
        };

        let last_input = self.last_input_chunk_len.load(Ordering::Relaxed);
        if last_input == 0 {
            return None;
        }
        let last_output = self.last_output_chunk_len.load(Ordering::Relaxed);
        let target = (spread + last_input.max(last_output)).max(1);
        self.target_queue_size.store(target, Ordering::Release);
        Some(target)
    }

    /// Forget depth history and target (after a device restart)
    pub fn reset_history(&self) {
        self.history.lock().clear();
        self.target_queue_size.store(0, Ordering::Release);
    }

    /// Occupancy and latency for display; never feeds back into control
    pub fn publish_status(&self, native_rate: u32) -> BufferStatus {
        let target = match self.target_queue_size() {
            Some(t) if native_rate > 0 => t,
            _ => return BufferStatus::default(),
        };
        let rate = native_rate as f64;
        let queued_seconds = self.queued_samples() as f64 / OUTPUT_CHANNELS as f64 / rate;
        let target_seconds = target as f64 / OUTPUT_CHANNELS as f64 / rate;

        BufferStatus {
            buffered_fraction: round_to((queued_seconds / target_seconds).clamp(0.0, 2.0), 2),
            target_latency_seconds: round_to(target_seconds, 3),
        }
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            queued_chunks: self.queue.len(),
            queued_samples: self.queued_samples(),
            target_queue_size: self.target_queue_size(),
            chunks_pushed: self.chunks_pushed.load(Ordering::Relaxed),
            chunks_popped: self.chunks_popped.load(Ordering::Relaxed),
            extreme_overruns: self.extreme_overruns.load(Ordering::Relaxed),
        }
    }

    /// Full rescan of queued samples; preserves order
    #[cfg(test)]
    pub(crate) fn recount_samples(&self) -> usize {
        let mut held = Vec::new();
        while let Some(chunk) = self.queue.pop() {
            held.push(chunk);
        }
        let total = held.iter().map(Chunk::len).sum();
        for chunk in held {
            let _ = self.queue.push(chunk);
        }
        total
    }
}

impl Default for JitterBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn chunk(len: usize) -> Chunk {
        Chunk::new(vec![0.25; len])
    }

    #[test]
    fn test_push_pop_fifo() {
        let buffer = JitterBuffer::new();
        assert_eq!(buffer.push(Chunk::new(vec![1.0, 1.0])), PushOutcome::Queued);
        assert_eq!(buffer.push(Chunk::new(vec![2.0; 4])), PushOutcome::Queued);
        assert_eq!(buffer.queued_samples(), 6);

        assert_eq!(buffer.pop().unwrap().samples(), &[1.0, 1.0]);
        assert_eq!(buffer.queued_samples(), 4);
        assert_eq!(buffer.pop().unwrap().len(), 4);
        assert!(buffer.pop().is_none());
        assert_eq!(buffer.queued_samples(), 0);
    }

    #[test]
    fn test_extreme_overrun_resets_queue() {
        let buffer = JitterBuffer::new();
        for _ in 0..EXTREME_OVERRUN_CHUNKS {
            assert!(matches!(buffer.push(chunk(64)), PushOutcome::Queued));
        }
        assert_eq!(buffer.len(), EXTREME_OVERRUN_CHUNKS);

        let outcome = buffer.push(chunk(64));
        assert_eq!(
            outcome,
            PushOutcome::ExtremeOverrun {
                dropped_chunks: EXTREME_OVERRUN_CHUNKS + 1
            }
        );
        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.queued_samples(), 0);
        assert_eq!(buffer.stats().extreme_overruns, 1);
    }

    #[test]
    fn test_target_from_history_spread() {
        let buffer = JitterBuffer::new();
        buffer.push(chunk(256));
        buffer.note_output_chunk_len(512);

        let mut target = None;
        for depth in [1000, 1200, 900, 1100] {
            target = buffer.record_depth(depth);
        }
        assert_eq!(target, Some(812));
        assert_eq!(buffer.target_queue_size(), Some(812));
    }

    #[test]
    fn test_target_undefined_before_first_chunk() {
        let buffer = JitterBuffer::new();
        buffer.note_output_chunk_len(512);
        assert_eq!(buffer.record_depth_sample(), None);
        assert_eq!(buffer.target_queue_size(), None);
        assert_eq!(buffer.publish_status(48000), BufferStatus::default());
    }

    #[test]
    fn test_target_with_single_sample_is_chunk_size() {
        let buffer = JitterBuffer::new();
        buffer.push(chunk(300));
        assert_eq!(buffer.record_depth_sample(), Some(300));
    }

    #[test]
    fn test_history_window_ages_out() {
        let buffer = JitterBuffer::new();
        buffer.push(chunk(100));
        buffer.record_depth(5000);
        for _ in 0..DEPTH_HISTORY_LEN {
            buffer.record_depth(200);
        }
        assert_eq!(buffer.target_queue_size(), Some(100));
    }

    #[test]
    fn test_publish_status() {
        let buffer = JitterBuffer::new();
        buffer.push(chunk(960));
        buffer.record_depth_sample();
        buffer.push(chunk(960));

        let status = buffer.publish_status(48000);
        assert_eq!(status.buffered_fraction, 2.0);
        assert_eq!(status.target_latency_seconds, 0.01);
    }

    #[test]
    fn test_flush_sets_request() {
        let buffer = JitterBuffer::new();
        buffer.push(chunk(10));
        buffer.push(chunk(10));
        assert_eq!(buffer.flush(), 2);
        assert_eq!(buffer.queued_samples(), 0);
        assert!(buffer.take_flush_request());
        assert!(!buffer.take_flush_request());
    }

    proptest! {
        #[test]
        fn prop_queued_samples_matches_queue(ops in proptest::collection::vec(proptest::option::of(1usize..512), 0..300)) {
            let buffer = JitterBuffer::new();
            for op in ops {
                match op {
                    Some(len) => { buffer.push(chunk(len)); }
                    None => { buffer.pop(); }
                }
                prop_assert_eq!(buffer.queued_samples(), buffer.recount_samples());
            }
        }
    }
}
