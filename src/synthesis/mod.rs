//! # Synthesis Module
//!
//! Text-to-speech for assistant replies. One [`SpeechSynthesizer`] is shared
//! by every active call.

pub mod backend;
pub mod synthesizer;

pub use backend::HttpSpeechBackend;
pub use synthesizer::{Readiness, SpeechAudio, SpeechSynthesizer};
