//! # Transcription Worker
//!
//! One worker per call. It is the only consumer of that call's window queue,
//! so windows are transcribed strictly in order and never more than one at a
//! time.
//!
//! ## Per window:
//! 1. Frame the samples as WAV
//! 2. Ask the transcriber, bounded by the configured timeout
//! 3. Trimmed text non-empty → emit a final [`Utterance`] and audit it
//! 4. Empty text → discard quietly
//! 5. Failure → log, audit, drop the window, carry on with the next one
//!
//! A cancelled call abandons the in-flight request immediately.

use crate::audio::wavfile::encode_wav;
use crate::audio::AudioWindow;
use crate::audit::{actions, AuditEvent, AuditEventType, AuditSink};
use crate::cancel::CancelToken;
use crate::error::PipelineError;
use crate::metrics::PipelineMetrics;
use crate::transcription::client::Transcriber;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A finalized piece of patient speech.
#[derive(Debug, Clone, Serialize)]
pub struct Utterance {
    pub text: String,
    pub is_final: bool,
    pub timestamp: DateTime<Utc>,
    /// Sequence number of the window this text came from
    pub window_sequence: u64,
}

pub struct TranscriptionWorker {
    call_id: String,
    patient_ref: Option<String>,
    transcriber: Arc<dyn Transcriber>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<PipelineMetrics>,
    timeout: Duration,
}

impl TranscriptionWorker {
    pub fn new(
        call_id: String,
        patient_ref: Option<String>,
        transcriber: Arc<dyn Transcriber>,
        audit: Arc<dyn AuditSink>,
        metrics: Arc<PipelineMetrics>,
        timeout: Duration,
    ) -> Self {
        Self {
            call_id,
            patient_ref,
            transcriber,
            audit,
            metrics,
            timeout,
        }
    }

    /// Drain the window queue until it closes or the call is cancelled.
    pub async fn run(
        self,
        mut windows: mpsc::Receiver<AudioWindow>,
        utterances: mpsc::Sender<Utterance>,
        mut cancel: CancelToken,
    ) {
        debug!(call_id = %self.call_id, "transcription worker started");

        loop {
            let window = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = windows.recv() => match next {
                    Some(window) => window,
                    None => break,
                },
            };

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(call_id = %self.call_id, sequence = window.sequence, "abandoning in-flight transcription");
                    break;
                }
                result = self.transcribe_window(&window) => result,
            };

            match result {
                Ok(Some(utterance)) => {
                    self.metrics.record(|m| {
                        m.windows_transcribed += 1;
                        m.utterances += 1;
                    });
                    self.audit.record(
                        AuditEvent::new(AuditEventType::PatientCall, actions::UTTERANCE_FINALIZED)
                            .call(&self.call_id)
                            .patient(self.patient_ref.as_deref())
                            .details(json!({
                                "window_sequence": utterance.window_sequence,
                                "characters": utterance.text.chars().count(),
                            })),
                    );

                    let delivered = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => false,
                        sent = utterances.send(utterance) => sent.is_ok(),
                    };
                    if !delivered {
                        break;
                    }
                }
                Ok(None) => {
                    self.metrics.record(|m| {
                        m.windows_transcribed += 1;
                        m.empty_transcripts += 1;
                    });
                    debug!(call_id = %self.call_id, sequence = window.sequence, "empty transcript discarded");
                }
                Err(e) => {
                    self.metrics.record(|m| m.transcription_failures += 1);
                    warn!(call_id = %self.call_id, sequence = window.sequence, "window dropped: {}", e);
                    self.audit.record(
                        AuditEvent::new(AuditEventType::Error, actions::TRANSCRIPTION_FAILED)
                            .call(&self.call_id)
                            .patient(self.patient_ref.as_deref())
                            .details(json!({
                                "window_sequence": window.sequence,
                                "error": e.kind(),
                                "message": e.to_string(),
                            }))
                            .failed(),
                    );
                }
            }
        }

        debug!(call_id = %self.call_id, "transcription worker stopped");
    }

    async fn transcribe_window(&self, window: &AudioWindow) -> Result<Option<Utterance>, PipelineError> {
        let started = Instant::now();
        let wav = encode_wav(&window.samples, window.sample_rate)
            .map_err(|e| PipelineError::Transcription(format!("WAV framing failed: {}", e)))?;

        let text = tokio::time::timeout(self.timeout, self.transcriber.transcribe(wav))
            .await
            .map_err(|_| {
                PipelineError::Transcription(format!("timed out after {:?}", self.timeout))
            })??;

        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }

        info!(
            call_id = %self.call_id,
            sequence = window.sequence,
            audio_secs = window.duration_seconds(),
            final_window = window.is_flush,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "utterance finalized"
        );

        Ok(Some(Utterance {
            text: text.to_string(),
            is_final: true,
            timestamp: Utc::now(),
            window_sequence: window.sequence,
        }))
    }
}
