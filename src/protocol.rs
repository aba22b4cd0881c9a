//! Wire protocol between the radio server and this receiver
//!
//! Each transport message is exactly one of:
//! - a JSON text message describing the stream format, or
//! - a binary message of native-endian `f32` samples interleaved by channel.
//!
//! There is no framing beyond the transport's own message boundaries.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// A message as delivered by the transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportMessage {
    Text(String),
    Binary(Bytes),
}

/// Channel count and sample rate of the incoming stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    /// 1 (mono) or 2 (stereo)
    pub channel_count: u16,
    /// Stream sample rate in Hz, always positive
    pub stream_sample_rate: u32,
}

/// Result of decoding one transport message
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedMessage {
    Metadata(StreamFormat),
    PcmFrame(Vec<f32>),
    Malformed(String),
}

impl DecodedMessage {
    /// Convert a malformed message into its protocol error
    pub fn into_result(self) -> Result<DecodedMessage, ProtocolError> {
        match self {
            DecodedMessage::Malformed(reason) => Err(ProtocolError::Malformed(reason)),
            other => Ok(other),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    AudioStreamMetadata { signal_type: SignalType },
}

#[derive(Debug, Serialize, Deserialize)]
struct SignalType {
    kind: String,
    sample_rate: f64,
}

/// Decode a single transport message. Pure; never fails, malformed input is a variant.
pub fn decode(message: &TransportMessage) -> DecodedMessage {
    match message {
        TransportMessage::Text(text) => decode_metadata(text),
        TransportMessage::Binary(bytes) => decode_pcm(bytes),
    }
}

fn decode_metadata(text: &str) -> DecodedMessage {
    let parsed: ServerMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => return DecodedMessage::Malformed(format!("bad metadata: {}", e)),
    };

    let ServerMessage::AudioStreamMetadata { signal_type } = parsed;
    let rate = signal_type.sample_rate;
    if !rate.is_finite() || rate.round() < 1.0 || rate > u32::MAX as f64 {
        return DecodedMessage::Malformed(format!("bad sample rate: {}", rate));
    }

    let channel_count = if signal_type.kind == "STEREO" { 2 } else { 1 };
    DecodedMessage::Metadata(StreamFormat {
        channel_count,
        stream_sample_rate: rate.round() as u32,
    })
}

fn decode_pcm(bytes: &[u8]) -> DecodedMessage {
    if bytes.len() % 4 != 0 {
        return DecodedMessage::Malformed(format!(
            "binary message of {} bytes is not a whole number of f32 samples",
            bytes.len()
        ));
    }

    let samples = bytes
        .chunks_exact(4)
        .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    DecodedMessage::PcmFrame(samples)
}

/// Serialize a metadata message the way the server sends it
pub fn encode_metadata(format: &StreamFormat) -> String {
    let message = ServerMessage::AudioStreamMetadata {
        signal_type: SignalType {
            kind: (if format.channel_count == 2 { "STEREO" } else { "MONO" }).to_string(),
            sample_rate: format.stream_sample_rate as f64,
        },
    };
    // Serializing a plain struct of strings and numbers cannot fail
    serde_json::to_string(&message).unwrap_or_default()
}

/// Serialize samples into a binary PCM message
pub fn encode_pcm(samples: &[f32]) -> Bytes {
    let mut out = Vec::with_capacity(samples.len() * 4);
    for s in samples {
        out.extend_from_slice(&s.to_ne_bytes());
    }
    Bytes::from(out)
}

/// Build the connection URL carrying the requested rate as a JSON query value
pub fn stream_url(base: &str, requested_rate: u32) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    let rate = serde_json::Value::from(requested_rate);
    format!("{}{}rate={}", base, separator, rate)
}
