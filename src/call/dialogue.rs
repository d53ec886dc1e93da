//! # Dialogue Task
//!
//! The talking half of one call. It opens with a greeting, then answers each
//! finalized utterance in the order the worker produced them.
//!
//! ## Per utterance:
//! 1. Append the user turn (before anything is generated)
//! 2. Generate a reply from a snapshot of the history
//! 3. Append the assistant turn
//! 4. Synthesize and push the audio to the call
//!
//! The session lock is only held to read or append; never while waiting on a
//! capability. If no reply can be generated nothing is appended and the task
//! waits for the next utterance. Synthesis failures cost the call its audio
//! for that turn, nothing more.

use crate::audit::{actions, AuditEvent, AuditEventType, AuditSink};
use crate::call::outbound::OutboundSink;
use crate::call::registry::CallHandle;
use crate::cancel::CancelToken;
use crate::conversation::instructions::STATIC_GREETING;
use crate::conversation::{Reply, ResponseGenerator};
use crate::error::PipelineError;
use crate::metrics::PipelineMetrics;
use crate::synthesis::SpeechSynthesizer;
use crate::transcription::Utterance;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct Dialogue {
    handle: Arc<CallHandle>,
    patient_ref: Option<String>,
    generator: Arc<ResponseGenerator>,
    synthesizer: Arc<SpeechSynthesizer>,
    outbound: Arc<dyn OutboundSink>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<PipelineMetrics>,
}

impl Dialogue {
    pub fn new(
        handle: Arc<CallHandle>,
        patient_ref: Option<String>,
        generator: Arc<ResponseGenerator>,
        synthesizer: Arc<SpeechSynthesizer>,
        outbound: Arc<dyn OutboundSink>,
        audit: Arc<dyn AuditSink>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            handle,
            patient_ref,
            generator,
            synthesizer,
            outbound,
            audit,
            metrics,
        }
    }

    pub async fn run(self, mut utterances: mpsc::Receiver<Utterance>, mut cancel: CancelToken) {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = self.greet() => {}
        }

        loop {
            let utterance = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = utterances.recv() => match next {
                    Some(utterance) => utterance,
                    None => break,
                },
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(call_id = %self.call_id(), "abandoning reply for cancelled call");
                    break;
                }
                _ = self.respond(utterance) => {}
            }
        }

        debug!(call_id = %self.call_id(), "dialogue stopped");
    }

    fn call_id(&self) -> &str {
        self.handle.call_id()
    }

    /// Generate the opening line, activate the session and speak it.
    async fn greet(&self) {
        let (history, kind) = {
            let session = self.handle.session().lock().await;
            (session.history().to_vec(), session.context().reminder_kind)
        };

        let (greeting, generated) = match self.generator.generate_greeting(&history, kind).await {
            Ok(reply) => (reply.text.clone(), Some(reply)),
            Err(e) => {
                warn!(call_id = %self.call_id(), "greeting generation failed, using static greeting: {}", e);
                self.metrics.record(|m| m.greeting_fallbacks += 1);
                self.audit.record(
                    AuditEvent::new(AuditEventType::PatientCall, actions::GREETING_FALLBACK)
                        .call(self.call_id())
                        .patient(self.patient_ref.as_deref())
                        .details(json!({ "error": e.kind() })),
                );
                (STATIC_GREETING.to_string(), None)
            }
        };

        if let Err(e) = self.handle.session().lock().await.activate(&greeting) {
            debug!(call_id = %self.call_id(), "greeting discarded: {}", e);
            return;
        }
        info!(call_id = %self.call_id(), "session active");
        if let Some(reply) = &generated {
            self.audit_reply(reply, true);
        }

        self.speak(&greeting).await;
    }

    /// Answer one finalized utterance.
    pub async fn respond(&self, utterance: Utterance) {
        let history = {
            let mut session = self.handle.session().lock().await;
            if let Err(e) = session.append_user(&utterance.text) {
                warn!(call_id = %self.call_id(), "utterance ignored: {}", e);
                return;
            }
            session.history().to_vec()
        };

        let reply = match self.generator.generate(&history).await {
            Ok(reply) => reply,
            Err(e) => {
                self.metrics.record(|m| m.generation_failures += 1);
                warn!(call_id = %self.call_id(), "no reply for utterance: {}", e);
                self.audit.record(
                    AuditEvent::new(AuditEventType::Error, actions::GENERATION_FAILED)
                        .call(self.call_id())
                        .patient(self.patient_ref.as_deref())
                        .details(json!({
                            "window_sequence": utterance.window_sequence,
                            "error": e.kind(),
                        }))
                        .failed(),
                );
                return;
            }
        };

        if let Err(e) = self.handle.session().lock().await.append_assistant(&reply.text) {
            warn!(call_id = %self.call_id(), "reply discarded: {}", e);
            return;
        }

        self.metrics.record(|m| {
            m.replies += 1;
            if reply.used_fallback {
                m.fallback_replies += 1;
            }
        });
        self.audit_reply(&reply, false);

        self.speak(&reply.text).await;
    }

    fn audit_reply(&self, reply: &Reply, greeting: bool) {
        self.audit.record(
            AuditEvent::new(AuditEventType::PatientCall, actions::REPLY_GENERATED)
                .call(self.call_id())
                .patient(self.patient_ref.as_deref())
                .details(json!({
                    "model": reply.model,
                    "used_fallback": reply.used_fallback,
                    "greeting": greeting,
                    "characters": reply.text.chars().count(),
                })),
        );
    }

    async fn speak(&self, text: &str) {
        let synthesizer = {
            let mut session = self.handle.session().lock().await;
            session.attach_synthesizer(self.synthesizer.clone());
            session.synthesizer().cloned()
        };
        let Some(synthesizer) = synthesizer else {
            return;
        };

        match synthesizer.synthesize(text).await {
            Ok(audio) => {
                self.metrics.record(|m| m.synthesized_replies += 1);
                debug!(
                    call_id = %self.call_id(),
                    audio_secs = audio.duration_seconds(),
                    "reply synthesized"
                );
                if !self.outbound.send(self.call_id(), audio) {
                    debug!(call_id = %self.call_id(), "no media stream connected, reply audio dropped");
                }
            }
            Err(e) => {
                let not_ready = matches!(e, PipelineError::SynthesisNotReady(_));
                self.metrics.record(|m| {
                    if not_ready {
                        m.synthesis_not_ready += 1;
                    } else {
                        m.synthesis_failures += 1;
                    }
                });
                warn!(call_id = %self.call_id(), "reply not spoken: {}", e);
                self.audit.record(
                    AuditEvent::new(AuditEventType::Error, actions::SYNTHESIS_FAILED)
                        .call(self.call_id())
                        .patient(self.patient_ref.as_deref())
                        .details(json!({ "error": e.kind(), "message": e.to_string() }))
                        .failed(),
                );
            }
        }
    }
}
