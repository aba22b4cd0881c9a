//! Amplitude spectrum tap for the display collaborator
//!
//! Runs on the network context over received stream-rate samples (mono mix),
//! never on the audio thread.

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// One amplitude-spectrum frame, bins from DC up to Nyquist
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumFrame {
    /// Sample rate of the analysed signal
    pub sample_rate: u32,
    /// Magnitude per bin in dBFS
    pub magnitudes_db: Vec<f32>,
}

impl SpectrumFrame {
    /// Frequency of bin `index` in Hz
    pub fn bin_frequency(&self, index: usize) -> f32 {
        let fft_size = self.magnitudes_db.len() * 2;
        index as f32 * self.sample_rate as f32 / fft_size as f32
    }
}

/// Receiver of spectrum frames (the waterfall/spectrum display)
pub trait SpectrumSink: Send {
    fn accept(&mut self, frame: SpectrumFrame);
}

/// Windowed FFT over a sliding block of samples
pub struct SpectrumAnalyzer {
    fft_size: usize,
    window: Vec<f32>,
    pending: Vec<f32>,
    fft_buffer: Vec<Complex<f32>>,
    fft_plan: Arc<dyn Fft<f32>>,
}

impl SpectrumAnalyzer {
    /// `fft_size` is rounded up to a power of two, minimum 16
    pub fn new(fft_size: usize) -> Self {
        let n = fft_size.max(16).next_power_of_two();
        let window = (0..n)
            .map(|i| {
                let x = i as f32 / (n as f32 - 1.0);
                0.5 - 0.5 * (2.0 * std::f32::consts::PI * x).cos()
            })
            .collect();
        let mut planner = FftPlanner::new();

        Self {
            fft_size: n,
            window,
            pending: Vec::with_capacity(n),
            fft_buffer: vec![Complex::new(0.0, 0.0); n],
            fft_plan: planner.plan_fft_forward(n),
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Forget partially collected samples (format changed)
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    /// Feed interleaved samples; returns a frame for every completed block
    pub fn process(&mut self, samples: &[f32], channel_count: u16, sample_rate: u32) -> Vec<SpectrumFrame> {
        let channels = (channel_count as usize).max(1);
        let mut frames = Vec::new();

        for input in samples.chunks_exact(channels) {
            let mono = input.iter().sum::<f32>() / channels as f32;
            self.pending.push(mono);
            if self.pending.len() == self.fft_size {
                frames.push(self.analyse(sample_rate));
                self.pending.clear();
            }
        }
        frames
    }

    fn analyse(&mut self, sample_rate: u32) -> SpectrumFrame {
        for (i, sample) in self.pending.iter().enumerate() {
            self.fft_buffer[i] = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft_plan.process(&mut self.fft_buffer);

        // Hann window coherent gain is 0.5
        let scale = 2.0 / (self.fft_size as f32 * 0.5);
        let magnitudes_db = self.fft_buffer[..self.fft_size / 2]
            .iter()
            .map(|c| 20.0 * (c.norm() * scale).max(1e-10).log10())
            .collect();

        SpectrumFrame {
            sample_rate,
            magnitudes_db,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_per_block() {
        let mut analyzer = SpectrumAnalyzer::new(64);
        assert!(analyzer.process(&[0.0; 63], 1, 8000).is_empty());
        let frames = analyzer.process(&[0.0; 2], 1, 8000);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].magnitudes_db.len(), 32);
    }

    #[test]
    fn test_sine_peak_bin() {
        let n = 256;
        let rate = 8000;
        let mut analyzer = SpectrumAnalyzer::new(n);
        // Exactly bin 32
        let freq = 32.0 * rate as f32 / n as f32;
        let samples: Vec<f32> = (0..n)
            .flat_map(|i| {
                let v = (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin();
                [v, v]
            })
            .collect();

        let frames = analyzer.process(&samples, 2, rate);
        assert_eq!(frames.len(), 1);
        let peak = frames[0]
            .magnitudes_db
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i);
        assert_eq!(peak, Some(32));
        assert!((frames[0].bin_frequency(32) - freq).abs() < 0.01);
    }
}
