//! # Audio Processing Module
//!
//! Turns the telephony leg's audio into transcription windows, and synthesized
//! speech back into telephony audio.
//!
//! ## Key Components:
//! - **Resampler**: μ-law / PCM16 decoding and linear rate conversion (8kHz ↔ 16kHz)
//! - **Buffer**: Fixed-duration windowing with an end-of-stream flush
//! - **WAV**: Framing for the HTTP transcription and synthesis capabilities
//!
//! ## Audio Format Requirements:
//! - **Inbound**: 8kHz μ-law (or PCM16) mono, base64 in media events
//! - **Transcriber**: 16kHz mono f32 in [-1.0, 1.0], uploaded as 16-bit WAV
//! - **Outbound**: 8kHz μ-law mono

pub mod buffer;
pub mod resampler;
pub mod wavfile;

pub use buffer::{AudioWindow, TranscriptionBuffer};
pub use resampler::{AudioEncoding, AudioFrame, AudioResampler};
