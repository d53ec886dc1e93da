//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization between Rust structs and TOML/env/JSON
//! - **derive macros**: Automatically generate Debug, Clone, Serialize, Deserialize
//! - **Result<T, E>**: Loading and validation can fail, and the caller must handle it
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Special environment variables (HOST, PORT, OPENAI_API_KEY)
//! 2. Environment variables (APP_SERVER__PORT, APP_AUDIO__WINDOW_SECONDS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each stage of the call pipeline (audio, transcription, generation, synthesis)
/// gets its own section so that operators can tune one stage without touching
/// the others, e.g. `APP_SYNTHESIS__WARMUP_TIMEOUT_SECS=90`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub transcription: TranscriptionConfig,
    pub generation: GenerationConfig,
    pub synthesis: SynthesisConfig,
    pub audit: AuditConfig,
    pub persistence: PersistenceConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Audio ingestion settings for the telephony leg.
///
/// ## Fields:
/// - `inbound_sample_rate`: Rate assumed for frames that do not declare one (telephony is 8kHz)
/// - `target_sample_rate`: Rate the transcriber expects (16kHz)
/// - `window_seconds`: Duration of each transcription window
/// - `min_flush_seconds`: Shortest remainder that is still transcribed when a stream ends
/// - `queue_capacity`: Bound on the per-call frame, window and utterance queues
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub inbound_sample_rate: u32,
    pub target_sample_rate: u32,
    pub window_seconds: f64,
    pub min_flush_seconds: f64,
    pub queue_capacity: usize,
}

/// Speech-to-text capability settings (OpenAI-compatible transcription API).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub language: String,
    pub timeout_secs: u64,
}

/// Response-generation settings.
///
/// ## Primary and fallback:
/// Both models are reached through the same chat-completions contract; the
/// fallback is only asked when the primary errors, times out or returns nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub endpoint: String,
    pub api_key: String,
    pub primary_model: String,
    pub fallback_model: String,
    pub max_tokens: u32,
    pub greeting_max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
}

/// Speech synthesis settings.
///
/// ## Fields:
/// - `endpoint`: Base URL of the synthesis server
/// - `voice`: Speaker id passed to the synthesis server
/// - `output_sample_rate`: Rate of the PCM returned to the call pipeline
/// - `warmup_timeout_secs`: How long a request waits for the synthesizer to become ready
/// - `warmup_poll_ms`: Interval between readiness checks during warm-up
/// - `max_parallel`: Requests allowed through the fair gate at once
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    pub endpoint: String,
    pub voice: String,
    pub language: String,
    pub output_sample_rate: u32,
    pub warmup_timeout_secs: u64,
    pub warmup_poll_ms: u64,
    pub request_timeout_secs: u64,
    pub max_parallel: usize,
}

/// Where audit events are written.
///
/// When `log_dir` is empty the audit trail only goes to the tracing output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    pub log_dir: String,
}

/// Where call outcomes are stored.
///
/// When `outcome_dir` is empty outcomes are kept in memory only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub outcome_dir: String,
}

/// Performance tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    /// Upper bound on how long teardown waits for a call's tasks to stop
    pub teardown_timeout_secs: u64,
    /// How long a `/call/start` entry waits for its call to connect
    pub scheduled_call_ttl_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            audio: AudioConfig {
                inbound_sample_rate: 8000,
                target_sample_rate: 16000,
                window_seconds: 3.0,
                min_flush_seconds: 0.5,
                queue_capacity: 64,
            },
            transcription: TranscriptionConfig {
                endpoint: "https://api.openai.com/v1".to_string(),
                api_key: String::new(),
                model: "whisper-1".to_string(),
                language: "en".to_string(),
                timeout_secs: 30,
            },
            generation: GenerationConfig {
                endpoint: "https://api.openai.com/v1".to_string(),
                api_key: String::new(),
                primary_model: "gpt-4o".to_string(),
                fallback_model: "gpt-3.5-turbo".to_string(),
                max_tokens: 150,
                greeting_max_tokens: 100,
                temperature: 0.7,
                timeout_secs: 20,
            },
            synthesis: SynthesisConfig {
                endpoint: "http://127.0.0.1:5002".to_string(),
                voice: "p270".to_string(),
                language: "en".to_string(),
                output_sample_rate: 16000,
                warmup_timeout_secs: 60,
                warmup_poll_ms: 1000,
                request_timeout_secs: 30,
                max_parallel: 1,
            },
            audit: AuditConfig {
                log_dir: "logs".to_string(),
            },
            persistence: PersistenceConfig {
                outcome_dir: "data/outcomes".to_string(),
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 50,
                teardown_timeout_secs: 5,
                scheduled_call_ttl_secs: 3600,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_GENERATION__PRIMARY_MODEL=gpt-4o-mini`: Override the primary model
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    /// - `OPENAI_API_KEY=...`: Credential shared by transcription and generation
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // `__` separates nesting so that field names may keep their underscores
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("OPENAI_API_KEY") {
            settings = settings
                .set_override("transcription.api_key", key.clone())?
                .set_override("generation.api_key", key)?;
        }

        let config = settings
            .build()?
            .try_deserialize()
            .context("configuration could not be deserialized")?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Sample rates are non-zero and the window is longer than the flush minimum
    /// - Queues, sessions and the synthesis gate allow at least one item
    /// - Generation temperature is within the range accepted by chat APIs
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.inbound_sample_rate == 0 || self.audio.target_sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rates must be greater than 0"));
        }

        if self.audio.window_seconds <= 0.0 {
            return Err(anyhow::anyhow!("Transcription window must be longer than 0 seconds"));
        }

        if self.audio.min_flush_seconds < 0.0 || self.audio.min_flush_seconds > self.audio.window_seconds {
            return Err(anyhow::anyhow!(
                "Minimum flush duration must be between 0 and the window duration ({}s)",
                self.audio.window_seconds
            ));
        }

        if self.audio.queue_capacity == 0 {
            return Err(anyhow::anyhow!("Audio queue capacity must be greater than 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.performance.scheduled_call_ttl_secs == 0 {
            return Err(anyhow::anyhow!("Scheduled call TTL must be greater than 0"));
        }

        if self.synthesis.max_parallel == 0 {
            return Err(anyhow::anyhow!("Synthesis parallelism must be greater than 0"));
        }

        if self.synthesis.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Synthesis output sample rate must be greater than 0"));
        }

        if !(0.0..=2.0).contains(&self.generation.temperature) {
            return Err(anyhow::anyhow!("Generation temperature must be between 0.0 and 2.0"));
        }

        Ok(())
    }

    /// Refuse to start without credentials for the external capabilities.
    ///
    /// This is the only fatal configuration error: everything else that goes
    /// wrong during a call is recovered where it is detected.
    pub fn require_credentials(&self) -> Result<()> {
        if self.transcription.api_key.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "Missing transcription credentials: set OPENAI_API_KEY or APP_TRANSCRIPTION__API_KEY"
            ));
        }

        if self.generation.api_key.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "Missing generation credentials: set OPENAI_API_KEY or APP_GENERATION__API_KEY"
            ));
        }

        Ok(())
    }

    /// Copy of the configuration that is safe to return over HTTP.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.transcription.api_key = redact(&copy.transcription.api_key);
        copy.generation.api_key = redact(&copy.generation.api_key);
        copy
    }
}

impl TranscriptionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl GenerationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SynthesisConfig {
    pub fn warmup_timeout(&self) -> Duration {
        Duration::from_secs(self.warmup_timeout_secs)
    }
}

fn redact(secret: &str) -> String {
    if secret.is_empty() {
        String::new()
    } else {
        "********".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.audio.window_seconds, 3.0);
        assert_eq!(config.audio.min_flush_seconds, 0.5);
        assert_eq!(config.synthesis.warmup_timeout_secs, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.min_flush_seconds = 4.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.synthesis.max_parallel = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.performance.scheduled_call_ttl_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_credentials_fail_fast() {
        let mut config = AppConfig::default();
        assert!(config.require_credentials().is_err());

        config.transcription.api_key = "sk-test".to_string();
        assert!(config.require_credentials().is_err());

        config.generation.api_key = "sk-test".to_string();
        assert!(config.require_credentials().is_ok());
    }

    #[test]
    fn test_redacted_config_hides_keys() {
        let mut config = AppConfig::default();
        config.generation.api_key = "sk-secret".to_string();

        let redacted = config.redacted();
        assert_eq!(redacted.generation.api_key, "********");
        assert_eq!(redacted.transcription.api_key, "");
        assert_eq!(config.generation.api_key, "sk-secret");
    }

    #[test]
    fn test_partial_toml_file_overrides_defaults() {
        let file = r#"
            [audio]
            inbound_sample_rate = 8000
            target_sample_rate = 16000
            window_seconds = 2.5
            min_flush_seconds = 0.25
            queue_capacity = 16
        "#;

        let config: AppConfig = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default()).unwrap())
            .add_source(config::File::from_str(file, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.audio.window_seconds, 2.5);
        assert_eq!(config.audio.queue_capacity, 16);
        assert_eq!(config.generation.primary_model, "gpt-4o");
    }

    #[test]
    fn test_defaults_serialize_to_toml() {
        let rendered = toml::to_string(&AppConfig::default()).unwrap();
        assert!(rendered.contains("[synthesis]"));
        assert!(rendered.contains("voice = \"p270\""));
    }
}
