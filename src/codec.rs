//! Linear PCM codec
//!
//! Pure conversions between f32 sample buffers and base64-encoded 16-bit
//! signed little-endian PCM, the wire format the live session speaks in
//! both directions. No state, no hardware.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::{Error, Result};

/// Sample rate of captured microphone audio
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of synthesized speech from the model
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// A base64-encoded block of 16-bit PCM with its MIME descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    /// Base64-encoded little-endian i16 samples
    pub data: String,
    /// MIME descriptor, e.g. `audio/pcm;rate=16000`
    pub mime_type: String,
}

impl EncodedPacket {
    /// Wrap already-encoded base64 data arriving from the transport.
    #[must_use]
    pub const fn new(data: String, mime_type: String) -> Self {
        Self { data, mime_type }
    }
}

/// Encode f32 samples into a base64 PCM packet tagged at the capture rate.
///
/// Samples are clamped to [-1.0, 1.0] before the 16-bit narrowing, so
/// out-of-range input saturates instead of wrapping.
#[must_use]
pub fn encode(samples: &[f32]) -> EncodedPacket {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        #[allow(clippy::cast_possible_truncation)]
        let quantized = (f64::from(sample) * 32768.0).clamp(-32768.0, 32767.0) as i16;
        bytes.extend_from_slice(&quantized.to_le_bytes());
    }

    EncodedPacket {
        data: BASE64.encode(&bytes),
        mime_type: format!("audio/pcm;rate={CAPTURE_SAMPLE_RATE}"),
    }
}

/// Decode a base64 PCM packet back into mono f32 samples.
///
/// Multi-channel input is downmixed by averaging interleaved channels.
///
/// # Errors
///
/// Returns [`Error::Decode`] if the payload is not valid base64, if the
/// byte length is not a multiple of `2 * channels`, or if `channels` is 0.
pub fn decode(packet: &EncodedPacket, channels: u16) -> Result<Vec<f32>> {
    if channels == 0 {
        return Err(Error::Decode("channel count must be nonzero".to_string()));
    }

    let bytes = BASE64
        .decode(&packet.data)
        .map_err(|e| Error::Decode(format!("invalid base64 payload: {e}")))?;

    let frame_bytes = 2 * channels as usize;
    if bytes.len() % frame_bytes != 0 {
        return Err(Error::Decode(format!(
            "byte length {} is not a multiple of {frame_bytes}",
            bytes.len()
        )));
    }

    let samples = bytes
        .chunks_exact(frame_bytes)
        .map(|frame| {
            let sum: f32 = frame
                .chunks_exact(2)
                .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
                .sum();
            sum / f32::from(channels)
        })
        .collect();

    Ok(samples)
}
