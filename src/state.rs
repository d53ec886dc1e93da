//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every media-stream actor.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Many handlers and per-call tasks own the same collaborators
//! - **Cloning**: `AppState::clone()` only bumps reference counts; nothing is copied
//!
//! ### Trait objects (`Arc<dyn Trait>`)
//! - **Purpose**: The pipeline talks to capabilities (transcriber, chat models,
//!   speech, audit, outcome store) through traits
//! - **Why**: `from_config` wires the HTTP implementations; tests wire fakes
//!
//! ## What lives here:
//! - The configuration, read-only after start-up
//! - The [`CallPipeline`] and, through it, the session registry and metrics
//! - The outbound router that connects dialogue tasks to media-stream actors
//! - The process-wide speech synthesizer (for readiness reporting)

use crate::audit::{AuditSink, JsonlAuditSink, TracingAuditSink};
use crate::call::{
    CallDirectory, CallPipeline, OutboundRouter, PipelineServices, PipelineSettings, SessionRegistry,
};
use crate::config::AppConfig;
use crate::conversation::{ConversationAnalyzer, ResponseGenerator};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::persistence::{InMemoryOutcomeStore, JsonFileOutcomeStore, OutcomeStore};
use crate::synthesis::{HttpSpeechBackend, SpeechSynthesizer};
use crate::transcription::WhisperApiTranscriber;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    config: Arc<AppConfig>,
    pub pipeline: CallPipeline,
    pub outbound: Arc<OutboundRouter>,
    pub synthesizer: Arc<SpeechSynthesizer>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        pipeline: CallPipeline,
        outbound: Arc<OutboundRouter>,
        synthesizer: Arc<SpeechSynthesizer>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            pipeline,
            outbound,
            synthesizer,
            start_time: Instant::now(),
        }
    }

    /// Wire every collaborator from configuration.
    ///
    /// ## Choices made here:
    /// - Audit: JSON-lines files when `audit.log_dir` is set, tracing only otherwise
    /// - Outcomes: one JSON file per call when `persistence.outcome_dir` is set,
    ///   memory otherwise
    /// - Analysis uses the primary chat model
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let audit: Arc<dyn AuditSink> = if config.audit.log_dir.trim().is_empty() {
            Arc::new(TracingAuditSink)
        } else {
            Arc::new(
                JsonlAuditSink::new(&config.audit.log_dir)
                    .with_context(|| format!("failed to open audit directory {}", config.audit.log_dir))?,
            )
        };

        let store: Arc<dyn OutcomeStore> = if config.persistence.outcome_dir.trim().is_empty() {
            Arc::new(InMemoryOutcomeStore::new())
        } else {
            Arc::new(JsonFileOutcomeStore::new(&config.persistence.outcome_dir)?)
        };

        let generator = ResponseGenerator::from_config(&config.generation)?;
        let analyzer = ConversationAnalyzer::new(generator.primary(), config.generation.timeout());
        let synthesizer = Arc::new(SpeechSynthesizer::new(
            Arc::new(HttpSpeechBackend::new(&config.synthesis)?),
            &config.synthesis,
        ));
        let outbound = Arc::new(OutboundRouter::new());

        let services = PipelineServices {
            registry: Arc::new(SessionRegistry::new(
                config.performance.max_concurrent_sessions,
                config.audio.queue_capacity,
            )),
            directory: Arc::new(CallDirectory::with_ttl(Duration::from_secs(
                config.performance.scheduled_call_ttl_secs,
            ))),
            transcriber: Arc::new(WhisperApiTranscriber::new(&config.transcription)?),
            generator: Arc::new(generator),
            analyzer: Arc::new(analyzer),
            synthesizer: synthesizer.clone(),
            outbound: outbound.clone(),
            store,
            audit,
            metrics: Arc::new(PipelineMetrics::new()),
        };
        let pipeline = CallPipeline::new(services, PipelineSettings::from_config(&config));

        info!(
            primary_model = %config.generation.primary_model,
            fallback_model = %config.generation.fallback_model,
            transcription_model = %config.transcription.model,
            voice = %config.synthesis.voice,
            "call pipeline wired"
        );
        Ok(Self::new(config, pipeline, outbound, synthesizer))
    }

    pub fn get_config(&self) -> &AppConfig {
        &self.config
    }

    pub fn get_metrics_snapshot(&self) -> MetricsSnapshot {
        self.pipeline.metrics().snapshot()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn active_calls(&self) -> usize {
        self.pipeline.registry().len()
    }
}
