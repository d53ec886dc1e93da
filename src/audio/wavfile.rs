//! WAV framing for the HTTP capabilities.
//!
//! The transcription API wants a WAV file per window, and the synthesis server
//! answers with one. Both directions go through the `wav` crate.

use crate::audio::resampler::{float_to_pcm, pcm_to_float};
use std::io::Cursor;
use ::wav::{BitDepth, Header};

const PCM_FORMAT: u16 = 1;

/// Mono samples recovered from a WAV payload.
#[derive(Debug, Clone)]
pub struct DecodedWav {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Encode normalized mono samples as a 16-bit PCM WAV file.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> std::io::Result<Vec<u8>> {
    let header = Header::new(PCM_FORMAT, 1, sample_rate, 16);
    let track = BitDepth::Sixteen(float_to_pcm(samples));

    let mut cursor = Cursor::new(Vec::new());
    ::wav::write(header, &track, &mut cursor)?;
    Ok(cursor.into_inner())
}

/// Decode a WAV payload, downmixing to mono.
pub fn decode_wav(bytes: &[u8]) -> std::io::Result<DecodedWav> {
    let mut cursor = Cursor::new(bytes);
    let (header, track) = ::wav::read(&mut cursor)?;

    let interleaved: Vec<f32> = match track {
        BitDepth::Eight(data) => data.iter().map(|&s| (s as f32 - 128.0) / 128.0).collect(),
        BitDepth::Sixteen(data) => pcm_to_float(&data),
        BitDepth::TwentyFour(data) => data.iter().map(|&s| s as f32 / 8_388_608.0).collect(),
        BitDepth::ThirtyTwoFloat(data) => data,
        BitDepth::Empty => Vec::new(),
    };

    let channels = header.channel_count.max(1) as usize;
    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };

    Ok(DecodedWav {
        samples,
        sample_rate: header.sampling_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_window_has_riff_header() {
        let bytes = encode_wav(&vec![0.25; 1600], 16000).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
        // canonical 44 byte header plus two bytes per sample
        assert!(bytes.len() >= 44 + 3200);
    }

    #[test]
    fn test_stereo_payload_is_downmixed() {
        let header = Header::new(PCM_FORMAT, 2, 22050, 16);
        let track = BitDepth::Sixteen(vec![16384, 0, 16384, 0]);
        let mut cursor = Cursor::new(Vec::new());
        ::wav::write(header, &track, &mut cursor).unwrap();

        let decoded = decode_wav(&cursor.into_inner()).unwrap();
        assert_eq!(decoded.sample_rate, 22050);
        assert_eq!(decoded.samples, vec![0.25, 0.25]);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(decode_wav(b"definitely not a wav file").is_err());
    }
}
