//! # Speech-to-Text Client
//!
//! The transcriber is an external capability reached over HTTP. The worker only
//! sees the [`Transcriber`] trait, so tests (and other vendors) can plug in
//! without touching the call pipeline.
//!
//! ## Wire contract (OpenAI-compatible):
//! `POST {endpoint}/audio/transcriptions`, multipart form with
//! `file` (WAV), `model` and `language`, answered by `{"text": "..."}`.

use crate::config::TranscriptionConfig;
use crate::error::PipelineError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart;
use serde::Deserialize;

/// Turns one WAV-framed window into text.
///
/// An empty string is a valid answer (silence); errors are reported as
/// `PipelineError::Transcription`.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, wav: Vec<u8>) -> Result<String, PipelineError>;
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Whisper-style HTTP transcription backend.
pub struct WhisperApiTranscriber {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    language: String,
}

impl WhisperApiTranscriber {
    pub fn new(config: &TranscriptionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .context("failed to build transcription HTTP client")?;

        Ok(Self {
            client,
            url: format!("{}/audio/transcriptions", config.endpoint.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            language: config.language.clone(),
        })
    }
}

#[async_trait]
impl Transcriber for WhisperApiTranscriber {
    async fn transcribe(&self, wav: Vec<u8>) -> Result<String, PipelineError> {
        let part = multipart::Part::bytes(wav)
            .file_name("window.wav")
            .mime_str("audio/wav")
            .map_err(|e| PipelineError::Transcription(e.to_string()))?;

        let form = multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("language", self.language.clone());

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| PipelineError::Transcription(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Transcription(format!(
                "API returned {}: {}",
                status, body
            )));
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Transcription(format!("unreadable response: {}", e)))?;

        Ok(parsed.text)
    }
}
