//! # Audio Resampler
//!
//! Converts telephony audio into the format the transcriber expects, and back.
//!
//! ## Inbound path:
//! 1. **Decode**: G.711 μ-law bytes (or little-endian PCM16) → 16-bit samples
//! 2. **Normalize**: Scale from [-32768, 32767] to [-1.0, 1.0]
//! 3. **Rate conversion**: Linear interpolation from the frame's rate (8kHz) to the target (16kHz)
//!
//! ## Outbound path:
//! PCM16 at the synthesizer's rate → 8kHz → μ-law bytes for the call leg.
//!
//! Every function here is pure: a frame in, samples out. No state is carried
//! from one frame to the next, so the same resampler can be shared by every call.

use crate::error::PipelineError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Sample rate of the telephony leg in both directions.
pub const TELEPHONY_SAMPLE_RATE: u32 = 8000;

const MULAW_BIAS: i32 = 0x84;
const MULAW_CLIP: i32 = 32635;

/// Encoding tag carried by every inbound media event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioEncoding {
    /// G.711 μ-law, one byte per sample
    Mulaw,
    /// Signed 16-bit little-endian PCM
    Pcm16,
}

impl FromStr for AudioEncoding {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "mulaw" | "ulaw" | "audio/x-mulaw" | "pcmu" => Ok(AudioEncoding::Mulaw),
            "pcm16" | "linear16" | "l16" | "audio/l16" => Ok(AudioEncoding::Pcm16),
            other => Err(PipelineError::Decode(format!("unsupported encoding '{}'", other))),
        }
    }
}

/// One decoded inbound media payload.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub payload: Vec<u8>,
    pub sample_rate: u32,
    pub encoding: AudioEncoding,
}

impl AudioFrame {
    /// Build a frame from the base64 payload of a media event.
    pub fn from_base64(
        payload: &str,
        encoding: AudioEncoding,
        sample_rate: u32,
    ) -> Result<Self, PipelineError> {
        let payload = STANDARD
            .decode(payload.trim())
            .map_err(|e| PipelineError::Decode(format!("invalid base64 payload: {}", e)))?;

        Ok(Self {
            payload,
            sample_rate,
            encoding,
        })
    }
}

/// Stateless converter between telephony frames and transcriber samples.
#[derive(Debug, Clone, Copy)]
pub struct AudioResampler {
    target_rate: u32,
}

impl AudioResampler {
    pub fn new(target_rate: u32) -> Self {
        Self { target_rate }
    }

    /// Decode and rate-convert one inbound frame.
    ///
    /// ## Errors:
    /// Returns `PipelineError::Decode` for an empty payload, a zero sample rate,
    /// or PCM16 data with an odd number of bytes. The caller drops the frame.
    pub fn resample(&self, frame: &AudioFrame) -> Result<Vec<f32>, PipelineError> {
        if frame.payload.is_empty() {
            return Err(PipelineError::Decode("empty audio payload".to_string()));
        }
        if frame.sample_rate == 0 {
            return Err(PipelineError::Decode("frame declares a sample rate of 0".to_string()));
        }

        let pcm: Vec<i16> = match frame.encoding {
            AudioEncoding::Mulaw => frame.payload.iter().map(|&b| mulaw_to_linear(b)).collect(),
            AudioEncoding::Pcm16 => pcm16_bytes_to_samples(&frame.payload)?,
        };

        let normalized = pcm_to_float(&pcm);
        Ok(resample_linear(&normalized, frame.sample_rate, self.target_rate))
    }

    /// Convert synthesized PCM16 at `sample_rate` into μ-law bytes for the call leg.
    pub fn encode_outbound(&self, pcm: &[i16], sample_rate: u32) -> Vec<u8> {
        let normalized = pcm_to_float(pcm);
        let telephony = resample_linear(&normalized, sample_rate, TELEPHONY_SAMPLE_RATE);
        float_to_pcm(&telephony)
            .into_iter()
            .map(linear_to_mulaw)
            .collect()
    }
}

/// Expand one G.711 μ-law byte to a 16-bit linear sample.
pub fn mulaw_to_linear(byte: u8) -> i16 {
    let inverted = !byte;
    let sign = inverted & 0x80;
    let exponent = (inverted >> 4) & 0x07;
    let mantissa = (inverted & 0x0F) as i32;

    let magnitude = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Compress one 16-bit linear sample to G.711 μ-law.
pub fn linear_to_mulaw(sample: i16) -> u8 {
    let mut magnitude = sample as i32;
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0x00
    };

    magnitude = magnitude.min(MULAW_CLIP) + MULAW_BIAS;

    let mut exponent: i32 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && (magnitude & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }

    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

/// Read little-endian PCM16 bytes into samples.
pub fn pcm16_bytes_to_samples(bytes: &[u8]) -> Result<Vec<i16>, PipelineError> {
    if bytes.len() % 2 != 0 {
        return Err(PipelineError::Decode(
            "PCM16 payload length must be even".to_string(),
        ));
    }

    let mut samples = vec![0i16; bytes.len() / 2];
    LittleEndian::read_i16_into(bytes, &mut samples);
    Ok(samples)
}

/// Write samples as little-endian PCM16 bytes.
pub fn samples_to_pcm16_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut bytes);
    bytes
}

/// Scale 16-bit PCM to [-1.0, 1.0].
pub fn pcm_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&sample| sample as f32 / 32768.0).collect()
}

/// Scale floats back to 16-bit PCM, clamping anything out of range.
pub fn float_to_pcm(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&sample| (sample * 32768.0).clamp(-32768.0, 32767.0) as i16)
        .collect()
}

/// Linear-interpolation rate conversion.
///
/// Output length is `len * to / from` (rounded down), so an 8kHz frame of
/// 160 samples becomes exactly 320 samples at 16kHz.
pub fn resample_linear(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || samples.is_empty() || from == 0 || to == 0 {
        return samples.to_vec();
    }

    let out_len = (samples.len() as u64 * to as u64 / from as u64) as usize;
    let step = from as f64 / to as f64;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let position = i as f64 * step;
            let index = (position.floor() as usize).min(last);
            let fraction = (position - index as f64) as f32;
            let current = samples[index];
            let next = samples[(index + 1).min(last)];
            current + (next - current) * fraction
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mulaw_frame(samples: usize) -> AudioFrame {
        AudioFrame {
            payload: vec![0xFF; samples],
            sample_rate: 8000,
            encoding: AudioEncoding::Mulaw,
        }
    }

    #[test]
    fn test_mulaw_reference_points() {
        assert_eq!(mulaw_to_linear(0xFF), 0);
        assert_eq!(mulaw_to_linear(0x7F), 0);
        assert_eq!(mulaw_to_linear(0x80), 32124);
        assert_eq!(mulaw_to_linear(0x00), -32124);
        assert_eq!(linear_to_mulaw(0), 0xFF);
    }

    #[test]
    fn test_mulaw_companding_stays_close() {
        for sample in [-30000i16, -1200, -5, 7, 880, 12000, 32000] {
            let restored = mulaw_to_linear(linear_to_mulaw(sample)) as i32;
            let error = (restored - sample as i32).abs();
            // μ-law quantization step grows with magnitude, at most 1/16 of the segment
            assert!(error <= (sample as i32).abs() / 16 + 8, "{} -> {}", sample, restored);
        }
    }

    #[test]
    fn test_telephony_frame_doubles_to_16khz() {
        let resampler = AudioResampler::new(16000);
        let samples = resampler.resample(&mulaw_frame(160)).unwrap();
        assert_eq!(samples.len(), 320);
        assert!(samples.iter().all(|s| (-1.0..=1.0).contains(s)));
    }

    #[test]
    fn test_pcm16_frame_is_decoded() {
        let bytes = samples_to_pcm16_bytes(&[0, 16384, -16384, 32767]);
        let frame = AudioFrame {
            payload: bytes,
            sample_rate: 16000,
            encoding: AudioEncoding::Pcm16,
        };

        let samples = AudioResampler::new(16000).resample(&frame).unwrap();
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[1], 0.5);
        assert_eq!(samples[2], -0.5);
    }

    #[test]
    fn test_malformed_frames_are_decode_errors() {
        let resampler = AudioResampler::new(16000);

        let empty = AudioFrame { payload: vec![], sample_rate: 8000, encoding: AudioEncoding::Mulaw };
        assert!(matches!(resampler.resample(&empty), Err(PipelineError::Decode(_))));

        let odd = AudioFrame { payload: vec![1, 2, 3], sample_rate: 8000, encoding: AudioEncoding::Pcm16 };
        assert!(matches!(resampler.resample(&odd), Err(PipelineError::Decode(_))));

        let no_rate = AudioFrame { payload: vec![0xFF], sample_rate: 0, encoding: AudioEncoding::Mulaw };
        assert!(matches!(resampler.resample(&no_rate), Err(PipelineError::Decode(_))));

        assert!(AudioFrame::from_base64("not base64!!", AudioEncoding::Mulaw, 8000).is_err());
        assert!("opus".parse::<AudioEncoding>().is_err());
    }

    #[test]
    fn test_base64_payload_round_trip() {
        let encoded = STANDARD.encode([0xFFu8, 0x7F, 0x80]);
        let frame = AudioFrame::from_base64(&encoded, AudioEncoding::Mulaw, 8000).unwrap();
        assert_eq!(frame.payload, vec![0xFF, 0x7F, 0x80]);
    }

    #[test]
    fn test_outbound_encoding_downsamples_to_telephony_rate() {
        let resampler = AudioResampler::new(16000);
        let tone: Vec<i16> = (0..1600).map(|i| ((i % 40) as i16 - 20) * 500).collect();
        let mulaw = resampler.encode_outbound(&tone, 16000);
        assert_eq!(mulaw.len(), 800);
    }

    #[test]
    fn test_linear_interpolation_midpoints() {
        let out = resample_linear(&[0.0, 1.0], 1, 2);
        assert_eq!(out, vec![0.0, 0.5, 1.0, 1.0]);
    }
}
