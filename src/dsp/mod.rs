//! Signal processing on the network side of the pipeline

pub mod rate;
pub mod spectrum;
pub mod upsampler;

pub use rate::{minimize_sample_rate, pick_request_rate, RateNegotiator};
pub use spectrum::{SpectrumAnalyzer, SpectrumFrame, SpectrumSink};
pub use upsampler::{upsample, Upsampler};
