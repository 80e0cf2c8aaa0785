//! PCM wire codec.
//!
//! Pure conversions between linear PCM sample buffers and the wire encoding
//! used on the conversation channel: 16-bit signed little-endian samples,
//! base64 framed.
//!
//! # Audio Format
//!
//! - Outbound (to the agent): PCM 16-bit, 16kHz, mono
//! - Inbound (from the agent): PCM 16-bit, 24kHz, mono

use base64::prelude::*;
use thiserror::Error;

/// Sample rate of audio streamed to the remote agent.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of audio produced by the remote agent.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Scale factor between normalized float samples and i16.
const I16_SCALE: f32 = 32768.0;

/// Errors produced while decoding wire audio.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The payload is not valid base64, or its byte length is not a whole
    /// number of 16-bit samples.
    #[error("Malformed audio payload: {0}")]
    MalformedPayload(String),
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

// =============================================================================
// Byte packing
// =============================================================================

/// Pack samples as 16-bit little-endian bytes.
pub fn pcm_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

/// Unpack 16-bit little-endian bytes into samples.
///
/// Fails on an odd byte count (a truncated trailing sample).
pub fn bytes_to_pcm(bytes: &[u8]) -> CodecResult<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::MalformedPayload(format!(
            "{} bytes is not aligned to 16-bit samples",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

// =============================================================================
// Wire framing
// =============================================================================

/// Encode samples into the base64 wire representation.
pub fn encode(samples: &[i16]) -> String {
    BASE64_STANDARD.encode(pcm_to_bytes(samples))
}

/// Decode the base64 wire representation into samples.
pub fn decode(wire: &str) -> CodecResult<Vec<i16>> {
    let bytes = BASE64_STANDARD
        .decode(wire.trim())
        .map_err(|e| CodecError::MalformedPayload(e.to_string()))?;
    bytes_to_pcm(&bytes)
}

// =============================================================================
// Sample conversion
// =============================================================================

/// Convert normalized float samples (-1.0..=1.0) to i16, clamping overs.
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|s| (s * I16_SCALE).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Convert i16 samples to normalized floats.
pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|s| *s as f32 / I16_SCALE).collect()
}

/// Linear-interpolation resampler.
///
/// Good enough for speech at the rates involved here; returns the input
/// unchanged when the rates match.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).round().max(1.0) as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos.floor() as usize;
            if idx >= last {
                return samples[last];
            }
            let frac = (pos - idx as f64) as f32;
            samples[idx] + (samples[idx + 1] - samples[idx]) * frac
        })
        .collect()
}

/// Linear resampler for a continuous stream delivered in blocks.
///
/// Keeps the fractional read position and the last sample of the previous
/// block, so block boundaries neither click nor drift.
#[derive(Debug, Clone)]
pub struct StreamResampler {
    step: f64,
    passthrough: bool,
    /// Read position relative to the start of the next block; `-1.0..0.0`
    /// points between `previous` and the block's first sample.
    position: f64,
    previous: Option<f32>,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        let passthrough = from_rate == to_rate || from_rate == 0 || to_rate == 0;
        Self {
            step: if passthrough {
                1.0
            } else {
                from_rate as f64 / to_rate as f64
            },
            passthrough,
            position: 0.0,
            previous: None,
        }
    }

    /// Resample the next block of the stream.
    pub fn process(&mut self, block: &[f32]) -> Vec<f32> {
        if self.passthrough || block.is_empty() {
            return block.to_vec();
        }

        let len = block.len() as f64;
        let sample_at = |index: isize, previous: Option<f32>| -> f32 {
            if index < 0 {
                previous.unwrap_or(block[0])
            } else {
                block[index as usize]
            }
        };

        let mut out = Vec::with_capacity((len / self.step).ceil() as usize + 1);
        while self.position < len - 1.0 {
            let index = self.position.floor() as isize;
            let frac = (self.position - index as f64) as f32;
            let a = sample_at(index, self.previous);
            let b = sample_at(index + 1, self.previous);
            out.push(a + (b - a) * frac);
            self.position += self.step;
        }

        self.position -= len;
        self.previous = block.last().copied();
        out
    }
}
