//! Error types for the audio receiver

use thiserror::Error;

/// Main error type for the receiver
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Output device errors
#[derive(Error, Debug, Clone)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Output thread is gone")]
    OutputClosed,

    #[error("Output stream did not answer {0} in time")]
    CommandTimeout(String),
}

/// Violations of the server's message protocol.
///
/// All of these are fatal to the current connection only.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("PCM frame received before stream metadata")]
    PcmBeforeMetadata,

    #[error("PCM frame of {samples} samples is not a whole number of {channels}-channel frames")]
    PartialFrame { samples: usize, channels: u16 },
}

/// Transport errors
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Close failed: {0}")]
    CloseFailed(String),
}

/// Configuration and rate negotiation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Stream rate {stream_rate} Hz does not divide native rate {native_rate} Hz")]
    NonIntegerRatio { native_rate: u32, stream_rate: u32 },

    #[error("Invalid sample rate: {0}")]
    InvalidRate(u32),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Failed to write config: {0}")]
    Write(String),

    #[error("No config directory available")]
    NoConfigDir,
}

/// Result type alias for the receiver
pub type Result<T> = std::result::Result<T, Error>;
