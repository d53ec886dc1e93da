//! # Call Pipeline
//!
//! Lifecycle glue between inbound call events and the per-call tasks.
//!
//! ## Per call:
//! ```text
//! frames ─▶ ingest (resample, window) ─▶ worker (transcribe) ─▶ dialogue (reply, speak) ─▶ outbound
//! ```
//! The ingest task supervises the worker and the dialogue task. All three
//! share the call's cancellation token, so a terminal status stops them at
//! their next await point.
//!
//! ## Events:
//! - `start`: register the session (with any scheduled context) and spawn the tasks
//! - `media`: queue the frame for the call; unknown calls are ignored with a warning
//! - `stop`: end the inbound stream; buffered audio is flushed and answered
//! - `status`: non-terminal statuses are ignored; terminal ones tear the call down
//!
//! ## Teardown:
//! 1. Session → `Closing` (a second terminal status is a no-op)
//! 2. Cancel the call's tasks and wait for them, bounded by the teardown timeout
//! 3. Summarize completed conversations and save the outcome
//! 4. Audit the close, session → `Closed`, forget the call

use crate::audio::{AudioFrame, AudioResampler, AudioWindow, TranscriptionBuffer};
use crate::audit::{actions, AuditEvent, AuditEventType, AuditSink};
use crate::call::dialogue::Dialogue;
use crate::call::directory::CallDirectory;
use crate::call::events::{CallEvent, CallStatus};
use crate::call::outbound::OutboundSink;
use crate::call::registry::{CallHandle, SessionRegistry};
use crate::cancel::CancelToken;
use crate::config::AppConfig;
use crate::conversation::{ConversationAnalyzer, ResponseGenerator};
use crate::error::PipelineError;
use crate::metrics::PipelineMetrics;
use crate::persistence::{CallOutcome, OutcomeStore};
use crate::synthesis::SpeechSynthesizer;
use crate::transcription::{Transcriber, TranscriptionWorker};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Added to the conversation when a dialed number had no scheduled record.
const UNSCHEDULED_NUMBER_CONTEXT: &str = "No scheduled patient record matched the dialed number. \
    Do not address the patient by name; confirm who you are speaking with first.";

/// Collaborators shared by every call.
pub struct PipelineServices {
    pub registry: Arc<SessionRegistry>,
    pub directory: Arc<CallDirectory>,
    pub transcriber: Arc<dyn Transcriber>,
    pub generator: Arc<ResponseGenerator>,
    pub analyzer: Arc<ConversationAnalyzer>,
    pub synthesizer: Arc<SpeechSynthesizer>,
    pub outbound: Arc<dyn OutboundSink>,
    pub store: Arc<dyn OutcomeStore>,
    pub audit: Arc<dyn AuditSink>,
    pub metrics: Arc<PipelineMetrics>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub target_sample_rate: u32,
    pub window_seconds: f64,
    pub min_flush_seconds: f64,
    pub queue_capacity: usize,
    pub transcription_timeout: Duration,
    pub teardown_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            target_sample_rate: config.audio.target_sample_rate,
            window_seconds: config.audio.window_seconds,
            min_flush_seconds: config.audio.min_flush_seconds,
            queue_capacity: config.audio.queue_capacity,
            transcription_timeout: config.transcription.timeout(),
            teardown_timeout: Duration::from_secs(config.performance.teardown_timeout_secs),
        }
    }
}

#[derive(Clone)]
pub struct CallPipeline {
    services: Arc<PipelineServices>,
    settings: Arc<PipelineSettings>,
}

impl CallPipeline {
    pub fn new(services: PipelineServices, settings: PipelineSettings) -> Self {
        Self {
            services: Arc::new(services),
            settings: Arc::new(settings),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.services.registry
    }

    pub fn directory(&self) -> &Arc<CallDirectory> {
        &self.services.directory
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.services.metrics
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.services.audit
    }

    /// Route one inbound event.
    ///
    /// Terminal statuses are torn down on a background task so that the
    /// caller (usually the media-stream actor) never waits on teardown.
    pub fn handle_event(&self, event: CallEvent) -> Result<(), PipelineError> {
        trace!(call_id = %event.call_id(), event = event.name(), "call event");
        match event {
            CallEvent::Start { call_id, to_number } => {
                self.start_call(&call_id, to_number.as_deref()).map(|_| ())
            }
            CallEvent::Media { call_id, frame } => self.handle_media(&call_id, frame),
            CallEvent::Stop { call_id } => self.handle_stop(&call_id),
            CallEvent::Status {
                call_id,
                status,
                duration_seconds,
            } => {
                if !status.is_terminal() {
                    debug!(call_id = %call_id, status = %status, "non-terminal status ignored");
                    return Ok(());
                }
                if self.services.registry.get(&call_id).is_none() {
                    return Err(self.ignore(&call_id, "status"));
                }
                let pipeline = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = pipeline.end_call(&call_id, status, duration_seconds).await {
                        warn!(call_id = %call_id, "teardown skipped: {}", e);
                    }
                });
                Ok(())
            }
        }
    }

    /// Register a call and spawn its tasks.
    pub fn start_call(
        &self,
        call_id: &str,
        to_number: Option<&str>,
    ) -> Result<Arc<CallHandle>, PipelineError> {
        let scheduled = to_number.and_then(|number| self.services.directory.take(number));
        let was_scheduled = scheduled.is_some();
        let context = scheduled.unwrap_or_default();

        let handle = match self.services.registry.create(call_id, context.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                self.services.metrics.record(|m| m.calls_rejected += 1);
                warn!(call_id = %call_id, "call rejected: {}", e);
                if let (Some(number), true) = (to_number, was_scheduled) {
                    self.services.directory.schedule(number, context);
                }
                return Err(e);
            }
        };

        let patient_ref = context.patient.as_ref().map(|p| p.patient_ref.clone());
        self.services.metrics.record(|m| m.calls_started += 1);
        self.services.audit.record(
            AuditEvent::new(AuditEventType::PatientCall, actions::SESSION_CREATED)
                .call(call_id)
                .patient(patient_ref.as_deref())
                .details(json!({
                    "reminder_kind": context.reminder_kind.as_str(),
                    "scheduled": was_scheduled,
                })),
        );
        info!(
            call_id = %call_id,
            reminder_kind = context.reminder_kind.as_str(),
            scheduled = was_scheduled,
            "call session created"
        );

        let lookup_missed = to_number.is_some() && !was_scheduled;
        if let Some(inbox) = handle.take_inbox() {
            let task = tokio::spawn(self.clone().supervise(handle.clone(), inbox, patient_ref, lookup_missed));
            handle.set_task(task);
        }
        Ok(handle)
    }

    /// Queue an inbound frame for its call.
    pub fn handle_media(&self, call_id: &str, frame: AudioFrame) -> Result<(), PipelineError> {
        let Some(handle) = self.services.registry.get(call_id) else {
            return Err(self.ignore(call_id, "media"));
        };

        self.services.metrics.record(|m| m.frames_received += 1);
        if !handle.offer_frame(frame) {
            self.services.metrics.record(|m| m.frames_dropped += 1);
            debug!(call_id = %call_id, "inbound frame dropped");
        }
        Ok(())
    }

    /// End the inbound audio stream of a call.
    pub fn handle_stop(&self, call_id: &str) -> Result<(), PipelineError> {
        let Some(handle) = self.services.registry.get(call_id) else {
            return Err(self.ignore(call_id, "stop"));
        };
        if handle.end_stream() {
            info!(call_id = %call_id, "media stream stopped");
        }
        Ok(())
    }

    /// Tear a call down after a terminal status.
    ///
    /// Returns the saved outcome, or `None` when the status was non-terminal
    /// or the call was already being torn down.
    pub async fn end_call(
        &self,
        call_id: &str,
        status: CallStatus,
        duration_seconds: Option<u64>,
    ) -> Result<Option<CallOutcome>, PipelineError> {
        if !status.is_terminal() {
            debug!(call_id = %call_id, status = %status, "non-terminal status ignored");
            return Ok(None);
        }
        let Some(handle) = self.services.registry.get(call_id) else {
            return Err(self.ignore(call_id, "status"));
        };

        if !handle.session().lock().await.begin_closing() {
            debug!(call_id = %call_id, "call already closing");
            return Ok(None);
        }
        info!(call_id = %call_id, status = %status, "call ended, tearing down");

        handle.cancel();
        if let Some(task) = handle.take_task() {
            let abort = task.abort_handle();
            match tokio::time::timeout(self.settings.teardown_timeout, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(call_id = %call_id, "call task ended abnormally: {}", e),
                Err(_) => {
                    warn!(call_id = %call_id, "call tasks did not stop in time, aborting");
                    abort.abort();
                }
            }
        }

        let outcome = self.build_outcome(&handle, status, duration_seconds).await;
        let saved = self.save_outcome(&outcome).await;

        self.services.audit.record(
            AuditEvent::new(AuditEventType::PatientCall, actions::SESSION_CLOSED)
                .call(call_id)
                .patient(outcome.patient_ref.as_deref())
                .details(json!({
                    "status": status.as_str(),
                    "duration_seconds": duration_seconds,
                    "turns": outcome.turn_count,
                    "outcome_saved": saved,
                })),
        );

        handle.session().lock().await.close();
        self.services.registry.remove(call_id);
        self.services.metrics.record(|m| m.calls_closed += 1);
        info!(call_id = %call_id, turns = outcome.turn_count, "call closed");

        Ok(Some(outcome))
    }

    fn ignore(&self, call_id: &str, event: &str) -> PipelineError {
        self.services.metrics.record(|m| m.ignored_events += 1);
        let error = PipelineError::UnknownCallId(call_id.to_string());
        warn!(call_id = %call_id, event, "event ignored: {}", error);
        error
    }

    async fn build_outcome(
        &self,
        handle: &CallHandle,
        status: CallStatus,
        duration_seconds: Option<u64>,
    ) -> CallOutcome {
        let (history, transcript, patient_ref, user_turns) = {
            let session = handle.session().lock().await;
            (
                session.history().to_vec(),
                session.transcript().to_string(),
                session.patient_ref().map(str::to_string),
                session.user_turns(),
            )
        };

        let (summary, outcome) = match status {
            CallStatus::Completed if user_turns > 0 => {
                let summary = self.services.analyzer.summarize(&history).await;
                self.services.audit.record(
                    AuditEvent::new(AuditEventType::PhiAccess, actions::CONVERSATION_ANALYZED)
                        .call(handle.call_id())
                        .patient(patient_ref.as_deref())
                        .details(json!({
                            "conversation_length": history.len(),
                            "kit_completed": summary.kit_completed,
                            "needs_new_kit": summary.needs_new_kit,
                        })),
                );
                let text = summary.outcome_text();
                (Some(summary), text)
            }
            CallStatus::Completed => (None, "Call completed. No patient speech recorded.".to_string()),
            other => (None, format!("Call {}. Patient not reached.", other)),
        };

        CallOutcome {
            call_id: handle.call_id().to_string(),
            patient_ref,
            status: status.as_str().to_string(),
            duration_seconds,
            outcome,
            summary,
            transcript,
            turn_count: history.len().saturating_sub(1),
            ended_at: Utc::now(),
        }
    }

    async fn save_outcome(&self, outcome: &CallOutcome) -> bool {
        let save = self.services.store.save_call_outcome(&outcome.call_id, outcome);
        let error = match tokio::time::timeout(self.settings.teardown_timeout, save).await {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", self.settings.teardown_timeout),
        };

        self.services.metrics.record(|m| m.outcome_save_failures += 1);
        warn!(call_id = %outcome.call_id, "call outcome not saved: {}", error);
        self.services.audit.record(
            AuditEvent::new(AuditEventType::Error, actions::OUTCOME_SAVE_FAILED)
                .call(&outcome.call_id)
                .patient(outcome.patient_ref.as_deref())
                .details(json!({ "message": error }))
                .failed(),
        );
        false
    }

    /// Ingest task of one call; owns the worker and dialogue tasks.
    async fn supervise(
        self,
        handle: Arc<CallHandle>,
        inbox: mpsc::Receiver<AudioFrame>,
        patient_ref: Option<String>,
        lookup_missed: bool,
    ) {
        let call_id = handle.call_id().to_string();
        // Before the dialogue starts, so the greeting sees it
        if lookup_missed {
            if let Err(e) = handle.session().lock().await.add_context(UNSCHEDULED_NUMBER_CONTEXT) {
                debug!(call_id = %call_id, "lookup context not added: {}", e);
            }
        }
        let capacity = self.settings.queue_capacity.max(1);
        let (window_tx, window_rx) = mpsc::channel(capacity);
        let (utterance_tx, utterance_rx) = mpsc::channel(capacity);

        let worker = TranscriptionWorker::new(
            call_id.clone(),
            patient_ref.clone(),
            self.services.transcriber.clone(),
            self.services.audit.clone(),
            self.services.metrics.clone(),
            self.settings.transcription_timeout,
        );
        let worker = tokio::spawn(worker.run(window_rx, utterance_tx, handle.token()));

        let dialogue = Dialogue::new(
            handle.clone(),
            patient_ref,
            self.services.generator.clone(),
            self.services.synthesizer.clone(),
            self.services.outbound.clone(),
            self.services.audit.clone(),
            self.services.metrics.clone(),
        );
        let dialogue = tokio::spawn(dialogue.run(utterance_rx, handle.token()));

        let ingest = Ingest {
            call_id: &call_id,
            resampler: AudioResampler::new(self.settings.target_sample_rate),
            buffer: TranscriptionBuffer::new(
                self.settings.target_sample_rate,
                self.settings.window_seconds,
                self.settings.min_flush_seconds,
            ),
            metrics: &self.services.metrics,
        };
        ingest.run(inbox, window_tx, handle.token()).await;

        if let Err(e) = worker.await {
            warn!(call_id = %call_id, "transcription worker ended abnormally: {}", e);
        }
        if let Err(e) = dialogue.await {
            warn!(call_id = %call_id, "dialogue ended abnormally: {}", e);
        }
        debug!(call_id = %call_id, "call tasks finished");
    }
}

/// Frames → samples → windows, for one call.
struct Ingest<'a> {
    call_id: &'a str,
    resampler: AudioResampler,
    buffer: TranscriptionBuffer,
    metrics: &'a PipelineMetrics,
}

impl Ingest<'_> {
    async fn run(
        mut self,
        mut frames: mpsc::Receiver<AudioFrame>,
        windows: mpsc::Sender<AudioWindow>,
        mut cancel: CancelToken,
    ) {
        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                next = frames.recv() => match next {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let samples = match self.resampler.resample(&frame) {
                Ok(samples) => samples,
                Err(e) => {
                    self.metrics.record(|m| m.frames_dropped += 1);
                    warn!(call_id = %self.call_id, "frame dropped: {}", e);
                    continue;
                }
            };

            for window in self.buffer.push(&samples) {
                if !forward(&windows, window, &mut cancel).await {
                    return;
                }
            }
        }

        let remainder_secs = self.buffer.pending_seconds();
        match self.buffer.flush() {
            Some(window) => {
                debug!(call_id = %self.call_id, audio_secs = remainder_secs, "flushing final window");
                forward(&windows, window, &mut cancel).await;
            }
            None => debug!(
                call_id = %self.call_id,
                audio_secs = remainder_secs,
                "stream ended, remainder too short to transcribe"
            ),
        }
    }
}

async fn forward(windows: &mpsc::Sender<AudioWindow>, window: AudioWindow, cancel: &mut CancelToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = windows.send(window) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioEncoding;
    use crate::audit::MemoryAuditSink;
    use crate::call::outbound::RecordingOutbound;
    use crate::conversation::generator::testing::ScriptedChat;
    use crate::conversation::session::Role;
    use crate::conversation::{CallContext, PatientContext, ReminderKind, SessionState};
    use crate::persistence::InMemoryOutcomeStore;
    use crate::synthesis::synthesizer::testing::{synthesizer, FakeSpeech};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowTranscriber {
        text: String,
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transcriber for SlowTranscriber {
        async fn transcribe(&self, _wav: Vec<u8>) -> Result<String, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(self.text.clone())
        }
    }

    struct Fixture {
        pipeline: CallPipeline,
        transcriber: Arc<SlowTranscriber>,
        audit: Arc<MemoryAuditSink>,
        store: Arc<InMemoryOutcomeStore>,
        outbound: Arc<RecordingOutbound>,
    }

    async fn fixture(transcript: &str, transcription_delay: Duration, chat: Vec<&str>) -> Fixture {
        let transcriber = Arc::new(SlowTranscriber {
            text: transcript.to_string(),
            delay: transcription_delay,
            calls: AtomicUsize::new(0),
        });
        let replies = chat.into_iter().map(|r| Ok(r.to_string())).collect();
        let mut generation = AppConfig::default().generation;
        generation.timeout_secs = 1;
        let generator = ResponseGenerator::new(
            ScriptedChat::new("gpt-4o", replies),
            ScriptedChat::failing("gpt-3.5-turbo"),
            &generation,
        );
        let analyzer = ConversationAnalyzer::new(
            ScriptedChat::new(
                "gpt-4o",
                vec![Ok(r#"{"kit_completed": true, "comments": "Kit already returned."}"#.to_string())],
            ),
            Duration::from_secs(1),
        );
        let speech = synthesizer(FakeSpeech::ready(16000), Duration::from_secs(1));
        if let Some(warmup) = speech.start_warmup() {
            warmup.await.unwrap();
        }

        let audit = Arc::new(MemoryAuditSink::default());
        let store = Arc::new(InMemoryOutcomeStore::new());
        let outbound = Arc::new(RecordingOutbound::default());
        let services = PipelineServices {
            registry: Arc::new(SessionRegistry::new(4, 64)),
            directory: Arc::new(CallDirectory::new()),
            transcriber: transcriber.clone(),
            generator: Arc::new(generator),
            analyzer: Arc::new(analyzer),
            synthesizer: speech,
            outbound: outbound.clone(),
            store: store.clone(),
            audit: audit.clone(),
            metrics: Arc::new(PipelineMetrics::new()),
        };
        let settings = PipelineSettings {
            teardown_timeout: Duration::from_secs(2),
            ..PipelineSettings::from_config(&AppConfig::default())
        };

        Fixture {
            pipeline: CallPipeline::new(services, settings),
            transcriber,
            audit,
            store,
            outbound,
        }
    }

    /// `seconds` of telephony silence as one μ-law frame.
    fn frame(seconds: f64) -> AudioFrame {
        AudioFrame {
            payload: vec![0xFF; (8000.0 * seconds) as usize],
            sample_rate: 8000,
            encoding: AudioEncoding::Mulaw,
        }
    }

    async fn wait_for_history(pipeline: &CallPipeline, call_id: &str, len: usize) {
        for _ in 0..200 {
            let handle = pipeline.registry().get(call_id).unwrap();
            if handle.session().lock().await.history().len() >= len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("history of {} never reached {} turns", call_id, len);
    }

    #[tokio::test]
    async fn test_completed_call_is_answered_summarized_and_saved() {
        let f = fixture(
            "I already sent it back",
            Duration::from_millis(1),
            vec!["Hi, calling about your FIT kit.", "Thank you for returning it!"],
        )
        .await;

        f.pipeline.handle_event(CallEvent::Start {
            call_id: "CA1".to_string(),
            to_number: None,
        })
        .unwrap();
        f.pipeline.handle_media("CA1", frame(3.0)).unwrap();
        wait_for_history(&f.pipeline, "CA1", 4).await;
        for _ in 0..200 {
            if f.outbound.sent().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let outcome = f
            .pipeline
            .end_call("CA1", CallStatus::Completed, Some(61))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            outcome.outcome,
            "Call completed. Summary: Kit already returned. Patient has completed the FIT kit."
        );
        assert!(outcome.transcript.contains("Patient: I already sent it back"));
        assert_eq!(f.store.get("CA1").unwrap(), outcome);
        assert_eq!(f.pipeline.registry().len(), 0);
        assert_eq!(f.outbound.sent().len(), 2);

        let actions = f.audit.actions();
        for expected in [
            actions::SESSION_CREATED,
            actions::UTTERANCE_FINALIZED,
            actions::REPLY_GENERATED,
            actions::CONVERSATION_ANALYZED,
            actions::SESSION_CLOSED,
        ] {
            assert!(actions.iter().any(|a| a == expected), "missing {}", expected);
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_transcription_closes_and_ignores_later_media() {
        let f = fixture("never heard", Duration::from_secs(30), vec!["Hello!"]).await;
        let handle = f.pipeline.start_call("CA2", None).unwrap();

        f.pipeline.handle_media("CA2", frame(3.0)).unwrap();
        while f.transcriber.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            f.pipeline.end_call("CA2", CallStatus::Canceled, None),
        )
        .await
        .expect("teardown should not wait for the transcriber")
        .unwrap()
        .unwrap();

        assert_eq!(outcome.outcome, "Call canceled. Patient not reached.");
        assert_eq!(handle.session().lock().await.state(), SessionState::Closed);
        assert!(f.pipeline.registry().get("CA2").is_none());

        let late = f.pipeline.handle_event(CallEvent::Media {
            call_id: "CA2".to_string(),
            frame: frame(0.02),
        });
        assert!(matches!(late, Err(PipelineError::UnknownCallId(_))));
        assert_eq!(f.pipeline.metrics().snapshot().ignored_events, 1);
        assert_eq!(f.audit.count(actions::UTTERANCE_FINALIZED), 0);
    }

    #[tokio::test]
    async fn test_stop_flushes_the_remainder() {
        let f = fixture(
            "yes",
            Duration::from_millis(1),
            vec!["Hello!", "Great."],
        )
        .await;
        f.pipeline.start_call("CA3", None).unwrap();

        // Shorter than one window, longer than the flush minimum
        f.pipeline.handle_media("CA3", frame(1.0)).unwrap();
        f.pipeline.handle_stop("CA3").unwrap();
        wait_for_history(&f.pipeline, "CA3", 4).await;

        let handle = f.pipeline.registry().get("CA3").unwrap();
        let session = handle.session().lock().await;
        assert_eq!(session.history()[2].role, Role::User);
        assert_eq!(session.history()[2].content, "yes");
        drop(session);

        // Frames after stop are dropped, not queued
        f.pipeline.handle_media("CA3", frame(1.0)).unwrap();
        assert_eq!(f.pipeline.metrics().snapshot().frames_dropped, 1);
    }

    #[tokio::test]
    async fn test_scheduled_context_is_used_and_duplicates_rejected() {
        let f = fixture("", Duration::from_millis(1), vec!["Hello Maria!"]).await;
        f.pipeline.directory().schedule(
            "+15550100199",
            CallContext {
                patient: Some(PatientContext {
                    patient_ref: "MRN-9".to_string(),
                    name: Some("Maria".to_string()),
                    phone_number: Some("+15550100199".to_string()),
                    kit_status: Default::default(),
                }),
                reminder_kind: ReminderKind::SecondReminder,
            },
        );

        let handle = f.pipeline.start_call("CA4", Some("+1 555 010 0199")).unwrap();
        assert_eq!(handle.session().lock().await.patient_ref(), Some("MRN-9"));

        assert!(matches!(
            f.pipeline.start_call("CA4", None),
            Err(PipelineError::SessionExists(_))
        ));
        assert_eq!(f.pipeline.metrics().snapshot().calls_rejected, 1);

        let created = f
            .audit
            .events()
            .into_iter()
            .find(|e| e.action == actions::SESSION_CREATED)
            .unwrap();
        assert_eq!(created.patient_ref.as_deref(), Some("MRN-9"));
        assert_eq!(created.details["reminder_kind"], "second_reminder");
    }

    #[tokio::test]
    async fn test_status_events() {
        let f = fixture("", Duration::from_millis(1), vec!["Hello!"]).await;
        f.pipeline.start_call("CA5", None).unwrap();

        assert!(f
            .pipeline
            .end_call("CA5", CallStatus::Ringing, None)
            .await
            .unwrap()
            .is_none());
        assert!(f.pipeline.registry().get("CA5").is_some());

        let outcome = f
            .pipeline
            .end_call("CA5", CallStatus::NoAnswer, Some(0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.outcome, "Call no-answer. Patient not reached.");
        assert!(outcome.summary.is_none());

        assert!(matches!(
            f.pipeline.end_call("CA5", CallStatus::Completed, None).await,
            Err(PipelineError::UnknownCallId(_))
        ));
        assert_eq!(f.audit.count(actions::SESSION_CLOSED), 1);
    }

    #[tokio::test]
    async fn test_unscheduled_number_adds_lookup_context_before_greeting() {
        let f = fixture("", Duration::from_millis(1), vec!["Hello!"]).await;
        f.pipeline.start_call("CA6", Some("+1 555 010 0777")).unwrap();
        wait_for_history(&f.pipeline, "CA6", 3).await;

        let handle = f.pipeline.registry().get("CA6").unwrap();
        let session = handle.session().lock().await;
        let history = session.history();
        assert_eq!(history[1].role, Role::System);
        assert!(history[1].content.contains("No scheduled patient record"));
        assert_eq!(history[2].role, Role::Assistant);
    }
}
