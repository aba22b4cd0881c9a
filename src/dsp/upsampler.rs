//! Zero-stuffing upsampler
//!
//! Raises a stream to the output device's native rate by an integer factor.
//! Only zeros are inserted; removing the spectral images is left to a low-pass
//! stage downstream whose cutoff is exposed via [`Upsampler::cutoff_hz`].

use crate::audio::buffer::Chunk;
use crate::constants::OUTPUT_CHANNELS;
use crate::dsp::rate::antialias_cutoff_hz;
use crate::protocol::StreamFormat;

/// Expand interleaved `frame` by `ratio` into a stereo chunk.
///
/// Each input frame becomes one real stereo frame followed by `ratio - 1`
/// zero frames. Mono input is duplicated to both channels. A trailing
/// incomplete input frame is ignored.
pub fn upsample(frame: &[f32], channel_count: u16, ratio: usize) -> Chunk {
    let channels = (channel_count as usize).max(1);
    let ratio = ratio.max(1);
    let input_frames = frame.len() / channels;
    let mut out = vec![0.0f32; input_frames * ratio * OUTPUT_CHANNELS];

    for (i, input) in frame.chunks_exact(channels).enumerate() {
        let left = input[0];
        let right = if channels >= 2 { input[1] } else { left };
        let base = i * ratio * OUTPUT_CHANNELS;
        out[base] = left;
        out[base + 1] = right;
    }

    Chunk::new(out)
}

/// Upsampling parameters for one stream format
///
/// Rebuilt wholesale whenever the server announces a new format, so a PCM
/// frame is never expanded with a stale channel count or ratio.
#[derive(Debug, Clone)]
pub struct Upsampler {
    format: StreamFormat,
    native_rate: u32,
    ratio: usize,
}

impl Upsampler {
    pub fn new(format: StreamFormat, native_rate: u32, ratio: u32) -> Self {
        Self {
            format,
            native_rate,
            ratio: ratio.max(1) as usize,
        }
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn ratio(&self) -> usize {
        self.ratio
    }

    /// Cutoff for the external anti-imaging filter
    pub fn cutoff_hz(&self) -> f32 {
        antialias_cutoff_hz(self.format.stream_sample_rate, self.native_rate)
    }

    pub fn upsample(&self, frame: &[f32]) -> Chunk {
        upsample(frame, self.format.channel_count, self.ratio)
    }
}
