//! # Radio Audio Receiver
//!
//! Receiver half of a streaming audio pipeline for a remote radio/DSP front end.
//! PCM arrives over an unreliable, variable-latency message transport and is
//! played on a local output device whose clock and buffer size we do not control.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                     NETWORK / CONTROL CONTEXT (tokio)                    │
//! │                                                                          │
//! │  ┌──────────────┐    ┌─────────────┐    ┌────────────┐   ┌───────────┐   │
//! │  │  Transport   │───▶│ WireCodec   │───▶│ Upsampler  │──▶│   push    │   │
//! │  │ (WebSocket)  │    │ (protocol)  │    │ (dsp)      │   │           │   │
//! │  └──────┬───────┘    └──────┬──────┘    └─────▲──────┘   └─────┬─────┘   │
//! │         │ reconnect         │ metadata        │ ratio          │         │
//! │  ┌──────┴───────────────────▼─────────────────┴──────┐         │         │
//! │  │        ConnectionSupervisor + RateNegotiator       │         │         │
//! │  └──────────────────────┬─────────────────────────────┘         │         │
//! │                         │ status / gate ticks                   │         │
//! └─────────────────────────┼───────────────────────────────────────┼─────────┘
//!                           ▼                                       ▼
//!                  ┌─────────────────┐                ┌──────────────────────┐
//!                  │  StatusBoard    │◀── publish ────│     JitterBuffer     │
//!                  │  (watch)        │                │  SPSC chunk queue +  │
//!                  └─────────────────┘                │  adaptive target     │
//!                                                     └──────────┬───────────┘
//! ┌──────────────────────────────────────────────────────────────┼───────────┐
//! │                  REAL-TIME AUDIO CONTEXT (cpal callback)      │ pop       │
//! │                                                    ┌──────────▼─────────┐ │
//! │                                                    │     PullEngine     │ │
//! │                                                    │ drain / compact /  │ │
//! │                                                    │ hold-last fill     │ │
//! │                                                    └──────────┬─────────┘ │
//! │                                                               ▼           │
//! │                                                       Output device       │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod dsp;
pub mod error;
pub mod network;
pub mod protocol;
pub mod status;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Output chunks are always interleaved stereo
    pub const OUTPUT_CHANNELS: usize = 2;

    /// Lowest sample rate that may be requested from the server
    pub const MIN_REQUEST_RATE: u32 = 6000;

    /// Rate assumed to carry all useful audio when picking a default
    pub const ASSUMED_USEFUL_RATE: u32 = 40000;

    /// Queue length (in chunks) beyond which all buffered audio is discarded
    pub const EXTREME_OVERRUN_CHUNKS: usize = 100;

    /// Slots in the chunk queue; must exceed `EXTREME_OVERRUN_CHUNKS`
    pub const QUEUE_CAPACITY: usize = 128;

    /// Number of fill-depth samples kept for adaptive sizing
    pub const DEPTH_HISTORY_LEN: usize = 200;

    /// Excess samples per dropped output frame during overrun compaction
    pub const COMPACTION_DIVISOR: usize = 1024;

    /// Dropped frames per callback above which an overrun is reported
    pub const OVERRUN_REPORT_FRAMES: usize = 50;

    /// WebSocket close code for application-level protocol errors
    pub const PROTOCOL_ERROR_CLOSE_CODE: u16 = 4000;

    /// Normal WebSocket closure
    pub const NORMAL_CLOSE_CODE: u16 = 1000;

    /// Seconds an error string stays visible without being refreshed
    pub const ERROR_DISPLAY_SECS: u64 = 1;

    /// Engine events buffered between the audio and network contexts
    pub const EVENT_CHANNEL_CAPACITY: usize = 64;
}
