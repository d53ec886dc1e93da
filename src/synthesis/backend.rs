//! Speech synthesis capability.
//!
//! ## Wire contract:
//! - `GET {endpoint}/health` → 2xx once the voice model is loaded
//! - `POST {endpoint}/api/tts` with `{"text", "speaker_id", "language"}` → WAV bytes

use crate::config::SynthesisConfig;
use crate::error::PipelineError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

#[async_trait]
pub trait SpeechBackend: Send + Sync {
    /// Succeeds once the backend can serve synthesis requests.
    async fn check_ready(&self) -> Result<(), PipelineError>;

    /// Render `text` as a WAV file.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, PipelineError>;
}

#[derive(Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
    speaker_id: &'a str,
    language: &'a str,
}

/// HTTP client for a Coqui-style TTS server.
pub struct HttpSpeechBackend {
    client: reqwest::Client,
    health_url: String,
    tts_url: String,
    voice: String,
    language: String,
}

impl HttpSpeechBackend {
    pub fn new(config: &SynthesisConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("failed to build synthesis HTTP client")?;
        let base = config.endpoint.trim_end_matches('/');

        Ok(Self {
            client,
            health_url: format!("{}/health", base),
            tts_url: format!("{}/api/tts", base),
            voice: config.voice.clone(),
            language: config.language.clone(),
        })
    }
}

#[async_trait]
impl SpeechBackend for HttpSpeechBackend {
    async fn check_ready(&self) -> Result<(), PipelineError> {
        let response = self
            .client
            .get(&self.health_url)
            .send()
            .await
            .map_err(|e| PipelineError::Synthesis(format!("readiness check failed: {}", e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(PipelineError::Synthesis(format!(
                "readiness check returned {}",
                response.status()
            )))
        }
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, PipelineError> {
        let response = self
            .client
            .post(&self.tts_url)
            .json(&TtsRequest {
                text,
                speaker_id: &self.voice,
                language: &self.language,
            })
            .send()
            .await
            .map_err(|e| PipelineError::Synthesis(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Synthesis(format!(
                "server returned {}: {}",
                status, body
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| PipelineError::Synthesis(format!("unreadable audio body: {}", e)))?;
        Ok(bytes.to_vec())
    }
}
