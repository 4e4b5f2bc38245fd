//! PCM helpers: float ⇄ 16-bit little-endian conversion, base64 wire
//! encoding, and frame amplitude.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

use crate::protocol::Blob;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Invalid base64 audio payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("PCM16 payload has odd length: {0} bytes")]
    OddLength(usize),
}

/// Decoded mono audio ready to be scheduled on an output context.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Root mean square of a frame, 0.0 for an empty frame.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Float samples in [-1, 1] to 16-bit little-endian bytes. Out-of-range
/// input is clamped.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        // float → int 转换在 Rust 中是饱和的，+1.0 会落在 i16::MAX
        let v = (s.clamp(-1.0, 1.0) * 32768.0) as i16;
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub fn pcm16_to_float(bytes: &[u8]) -> Result<Vec<f32>, DecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect())
}

/// Encode one captured frame for the realtime input channel.
pub fn encode_frame(samples: &[f32], sample_rate: u32) -> Blob {
    Blob {
        mime_type: format!("audio/pcm;rate={}", sample_rate),
        data: STANDARD.encode(float_to_pcm16(samples)),
    }
}

/// Decode an inline base64 PCM16 payload into a mono buffer at `sample_rate`.
pub fn decode_audio(data: &str, sample_rate: u32) -> Result<AudioBuffer, DecodeError> {
    let bytes = STANDARD.decode(data)?;
    let samples = pcm16_to_float(&bytes)?;
    Ok(AudioBuffer::new(samples, sample_rate))
}
