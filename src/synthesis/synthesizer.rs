//! # Speech Synthesizer
//!
//! Process-wide front for the synthesis backend, shared by every call.
//!
//! ## Warm-up:
//! The backend can take a long time to load its voice model. `start_warmup`
//! polls it in the background exactly once per process; until a readiness check
//! succeeds the synthesizer is not ready.
//!
//! ## Requests:
//! 1. Wait for readiness, at most `warmup_timeout` → `SynthesisNotReady` otherwise
//! 2. Take a permit from the fair gate (a FIFO `Semaphore`, so no call can be
//!    starved by another call's burst of replies)
//! 3. Render WAV, decode, convert to the target rate, return mono PCM16 LE

use crate::audio::resampler::{float_to_pcm, pcm16_bytes_to_samples, resample_linear, samples_to_pcm16_bytes};
use crate::audio::wavfile::decode_wav;
use crate::config::SynthesisConfig;
use crate::error::PipelineError;
use crate::synthesis::backend::SpeechBackend;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    /// Warm-up has not been started
    Cold,
    WarmingUp,
    Ready,
}

/// Synthesized speech: mono, 16-bit little-endian PCM.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechAudio {
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
}

impl SpeechAudio {
    pub fn samples(&self) -> Vec<i16> {
        pcm16_bytes_to_samples(&self.pcm).unwrap_or_default()
    }

    pub fn duration_seconds(&self) -> f64 {
        (self.pcm.len() / 2) as f64 / self.sample_rate as f64
    }
}

pub struct SpeechSynthesizer {
    backend: Arc<dyn SpeechBackend>,
    readiness: watch::Sender<Readiness>,
    warmup_started: AtomicBool,
    gate: Semaphore,
    target_rate: u32,
    warmup_timeout: Duration,
    poll_interval: Duration,
    request_timeout: Duration,
}

impl SpeechSynthesizer {
    pub fn new(backend: Arc<dyn SpeechBackend>, config: &SynthesisConfig) -> Self {
        let (readiness, _) = watch::channel(Readiness::Cold);
        Self {
            backend,
            readiness,
            warmup_started: AtomicBool::new(false),
            gate: Semaphore::new(config.max_parallel.max(1)),
            target_rate: config.output_sample_rate,
            warmup_timeout: config.warmup_timeout(),
            poll_interval: Duration::from_millis(config.warmup_poll_ms.max(1)),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    pub fn readiness(&self) -> Readiness {
        *self.readiness.borrow()
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// Begin probing the backend in the background.
    ///
    /// Only the first call spawns a task; later calls return `None`.
    pub fn start_warmup(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.warmup_started.swap(true, Ordering::SeqCst) {
            return None;
        }
        self.readiness.send_replace(Readiness::WarmingUp);

        let synthesizer = Arc::clone(self);
        Some(tokio::spawn(async move { synthesizer.warm_up().await }))
    }

    async fn warm_up(&self) {
        let started = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            match self.backend.check_ready().await {
                Ok(()) => {
                    self.readiness.send_replace(Readiness::Ready);
                    info!(
                        attempts,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "speech synthesizer ready"
                    );
                    return;
                }
                Err(e) if attempts == 1 => warn!("speech synthesizer not ready yet: {}", e),
                Err(e) => debug!(attempts, "speech synthesizer still warming up: {}", e),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Render `text` as PCM16 at the configured output rate.
    pub async fn synthesize(&self, text: &str) -> Result<SpeechAudio, PipelineError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(PipelineError::Synthesis("nothing to synthesize".to_string()));
        }

        self.wait_until_ready().await?;

        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| PipelineError::Synthesis("synthesis gate closed".to_string()))?;

        let wav = tokio::time::timeout(self.request_timeout, self.backend.synthesize(text))
            .await
            .map_err(|_| {
                PipelineError::Synthesis(format!("timed out after {:?}", self.request_timeout))
            })??;

        let decoded = decode_wav(&wav)
            .map_err(|e| PipelineError::Synthesis(format!("backend returned invalid WAV: {}", e)))?;
        if decoded.samples.is_empty() {
            return Err(PipelineError::Synthesis("backend returned no audio".to_string()));
        }

        let resampled = resample_linear(&decoded.samples, decoded.sample_rate, self.target_rate);
        Ok(SpeechAudio {
            pcm: samples_to_pcm16_bytes(&float_to_pcm(&resampled)),
            sample_rate: self.target_rate,
        })
    }

    async fn wait_until_ready(&self) -> Result<(), PipelineError> {
        let mut readiness = self.readiness.subscribe();
        let ready = tokio::time::timeout(
            self.warmup_timeout,
            readiness.wait_for(|state| *state == Readiness::Ready),
        )
        .await;

        match ready {
            Ok(Ok(_)) => Ok(()),
            _ => Err(PipelineError::SynthesisNotReady(self.warmup_timeout)),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{synthesizer, FakeSpeech};
    use super::*;

    #[tokio::test]
    async fn test_warm_synthesizer_returns_pcm_at_target_rate() {
        let synth = synthesizer(FakeSpeech::ready(22050), Duration::from_secs(1));
        synth.start_warmup().unwrap().await.unwrap();
        assert_eq!(synth.readiness(), Readiness::Ready);

        let audio = synth.synthesize("Thank you for returning your kit.").await.unwrap();
        assert_eq!(audio.sample_rate, 16000);
        assert_eq!(audio.pcm.len() % 2, 0);
        // 100ms at 16kHz
        assert_eq!(audio.samples().len(), 1600);
    }

    #[tokio::test]
    async fn test_warmup_timeout_is_not_ready() {
        let synth = synthesizer(FakeSpeech::never_ready(), Duration::from_millis(50));
        synth.start_warmup();

        let result = synth.synthesize("Hello").await;
        assert!(matches!(result, Err(PipelineError::SynthesisNotReady(_))));
        assert_eq!(synth.readiness(), Readiness::WarmingUp);
    }

    #[tokio::test]
    async fn test_warmup_runs_once() {
        let synth = synthesizer(FakeSpeech::ready(16000), Duration::from_secs(1));
        assert!(synth.start_warmup().is_some());
        assert!(synth.start_warmup().is_none());
    }

    #[tokio::test]
    async fn test_requests_before_warmup_wait_for_it() {
        let synth = synthesizer(FakeSpeech::ready(16000), Duration::from_secs(2));

        let pending = {
            let synth = synth.clone();
            tokio::spawn(async move { synth.synthesize("Are you still there?").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        synth.start_warmup();

        assert!(pending.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_gate_serves_requests_in_arrival_order() {
        let backend = FakeSpeech::slow(16000, Duration::from_millis(30));
        let synth = synthesizer(backend.clone(), Duration::from_secs(1));
        synth.start_warmup().unwrap().await.unwrap();

        let mut tasks = Vec::new();
        for text in ["call A first", "call A second", "call B first"] {
            let synth = synth.clone();
            tasks.push(tokio::spawn(async move { synth.synthesize(text).await }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(
            *backend.spoken.lock(),
            vec!["call A first", "call A second", "call B first"]
        );
    }

    #[tokio::test]
    async fn test_empty_text_is_rejected() {
        let synth = synthesizer(FakeSpeech::ready(16000), Duration::from_secs(1));
        assert!(matches!(
            synth.synthesize("   ").await,
            Err(PipelineError::Synthesis(_))
        ));
    }
}
