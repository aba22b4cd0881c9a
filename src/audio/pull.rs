//! Real-time pull engine
//!
//! Invoked from the output device callback with a fixed-size request. It must
//! never block: it only pops from the lock-free chunk queue, touches atomics,
//! and reports events with a non-blocking `try_send`.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::audio::buffer::{Chunk, JitterBuffer};
use crate::constants::{COMPACTION_DIVISOR, EVENT_CHANNEL_CAPACITY, OUTPUT_CHANNELS, OVERRUN_REPORT_FRAMES};

/// Something worth logging that happened on the audio thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// Part of a callback had to be padded with the held sample
    Underrun {
        missing_frames: usize,
        requested_frames: usize,
        consecutive: bool,
    },
    /// Output frames skipped in one callback to shed excess latency
    Overrun { dropped_frames: usize },
}

/// Result of one callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PullReport {
    pub real_frames: usize,
    pub dropped_frames: usize,
    pub underrun_frames: usize,
}

/// Position inside the chunk currently being drained
#[derive(Debug, Default)]
pub struct PullCursor {
    chunk: Option<Chunk>,
    /// Stereo frame index into `chunk`
    chunk_index: usize,
    fill_l: f32,
    fill_r: f32,
}

impl PullCursor {
    pub fn chunk_index(&self) -> usize {
        self.chunk_index
    }

    /// Interleaved samples left in the current chunk
    pub fn remaining_samples(&self) -> usize {
        self.chunk
            .as_ref()
            .map(|c| (c.frames() - self.chunk_index) * OUTPUT_CHANNELS)
            .unwrap_or(0)
    }

    /// Held sample pair used to pad underruns
    pub fn hold(&self) -> (f32, f32) {
        (self.fill_l, self.fill_r)
    }

    fn load(&mut self, chunk: Chunk) {
        self.chunk = Some(chunk);
        self.chunk_index = 0;
    }

    fn clear(&mut self) {
        self.chunk = None;
        self.chunk_index = 0;
    }

    /// Copy frames into `out` starting at frame `j`; returns the new write position
    fn drain_into(&mut self, out: &mut [f32], mut j: usize, frames: usize) -> usize {
        let exhausted = match &self.chunk {
            Some(chunk) => {
                let samples = chunk.samples();
                let available = chunk.frames();
                while j < frames && self.chunk_index < available {
                    out[j * 2] = samples[self.chunk_index * 2];
                    out[j * 2 + 1] = samples[self.chunk_index * 2 + 1];
                    j += 1;
                    self.chunk_index += 1;
                }
                self.chunk_index >= available
            }
            None => false,
        };
        if exhausted {
            self.clear();
        }
        j
    }
}

/// Flags and counters shared with the network context
#[derive(Debug, Default)]
pub struct EngineControl {
    reset_hold: AtomicBool,
    starving: AtomicBool,
    callbacks: AtomicU64,
    underruns: AtomicU64,
    dropped_frames: AtomicU64,
}

impl EngineControl {
    /// Zero the held sample before the next callback (used when resuming)
    pub fn request_hold_reset(&self) {
        self.reset_hold.store(true, Ordering::Release);
    }

    /// True if the last callback could not be filled with real data
    pub fn is_starving(&self) -> bool {
        self.starving.load(Ordering::Acquire)
    }

    pub fn callbacks(&self) -> u64 {
        self.callbacks.load(Ordering::Relaxed)
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }
}

/// Consumer side of the jitter buffer, owned by the audio callback
pub struct PullEngine {
    buffer: Arc<JitterBuffer>,
    cursor: PullCursor,
    control: Arc<EngineControl>,
    events: Sender<EngineEvent>,
    previous_underrun: bool,
}

impl PullEngine {
    /// Create an engine and the receiving end of its event channel
    pub fn new(buffer: Arc<JitterBuffer>) -> (Self, Receiver<EngineEvent>) {
        let (events, events_rx) = bounded(EVENT_CHANNEL_CAPACITY);
        let engine = Self {
            buffer,
            cursor: PullCursor::default(),
            control: Arc::new(EngineControl::default()),
            events,
            previous_underrun: false,
        };
        (engine, events_rx)
    }

    pub fn control(&self) -> Arc<EngineControl> {
        self.control.clone()
    }

    pub fn cursor(&self) -> &PullCursor {
        &self.cursor
    }

    /// Fill `out` (interleaved stereo) completely
    pub fn fill(&mut self, out: &mut [f32]) -> PullReport {
        let frames = out.len() / OUTPUT_CHANNELS;
        self.control.callbacks.fetch_add(1, Ordering::Relaxed);

        if self.control.reset_hold.swap(false, Ordering::AcqRel) {
            self.cursor.fill_l = 0.0;
            self.cursor.fill_r = 0.0;
        }
        if self.buffer.take_flush_request() {
            self.cursor.clear();
        }
        self.buffer.note_output_chunk_len(frames * OUTPUT_CHANNELS);

        let mut j = 0;
        let mut dropped = 0;
        loop {
            j = self.cursor.drain_into(out, j, frames);
            if j >= frames {
                break;
            }
            let Some(next) = self.buffer.pop() else {
                break;
            };
            self.cursor.load(next);

            // Skip ahead by retracting the write position when over target
            if let Some(target) = self.buffer.target_queue_size() {
                let queued = self.buffer.queued_samples();
                if queued > target {
                    let drop = (queued - target).div_ceil(COMPACTION_DIVISOR);
                    let retract = drop.min(j);
                    j -= retract;
                    dropped += retract;
                }
            }
        }

        if j > 0 {
            self.cursor.fill_l = out[(j - 1) * 2];
            self.cursor.fill_r = out[(j - 1) * 2 + 1];
        }
        for frame in out[j * 2..frames * 2].chunks_exact_mut(2) {
            frame[0] = self.cursor.fill_l;
            frame[1] = self.cursor.fill_r;
        }
        for sample in &mut out[frames * 2..] {
            *sample = 0.0;
        }

        if dropped > 0 {
            self.control.dropped_frames.fetch_add(dropped as u64, Ordering::Relaxed);
            if dropped > OVERRUN_REPORT_FRAMES {
                let _ = self.events.try_send(EngineEvent::Overrun { dropped_frames: dropped });
            }
        }

        let missing = frames - j;
        if missing > 0 {
            self.control.underruns.fetch_add(1, Ordering::Relaxed);
            // A whole-callback underrun means playback is idle, not glitching
            if missing != frames {
                let _ = self.events.try_send(EngineEvent::Underrun {
                    missing_frames: missing,
                    requested_frames: frames,
                    consecutive: self.previous_underrun,
                });
            }
        }
        self.previous_underrun = missing > 0;
        self.control.starving.store(missing > 0, Ordering::Release);

        self.buffer.record_depth_sample();

        PullReport {
            real_frames: j,
            dropped_frames: dropped,
            underrun_frames: missing,
        }
    }
}
