//! # Transcription Module
//!
//! Speech-to-text for live calls. The model itself is an external HTTP
//! capability; this module owns the queueing discipline around it.
//!
//! ## Key Components:
//! - **Client**: The `Transcriber` trait and the Whisper-style HTTP implementation
//! - **Worker**: Per-call FIFO consumer that turns windows into final utterances

pub mod client;
pub mod worker;

pub use client::{Transcriber, WhisperApiTranscriber};
pub use worker::{TranscriptionWorker, Utterance};
