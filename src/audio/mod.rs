//! Audio subsystem module

pub mod buffer;
pub mod device;
pub mod gate;
pub mod playback;
pub mod pull;

pub use buffer::{Chunk, JitterBuffer, PushOutcome};
pub use device::{get_output_device, list_output_devices, OutputDevice};
pub use gate::{PlaybackGate, PlaybackState};
pub use playback::{AudioOutput, CpalOutput, PlaybackController};
pub use pull::{EngineEvent, PullEngine};
