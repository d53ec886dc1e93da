//! # Error Handling
//!
//! Two error families live here:
//!
//! - [`PipelineError`] is the taxonomy used between the stages of a call
//!   (resampler, transcription, generation, synthesis, registry). None of its
//!   variants is fatal: each one is logged, audited and recovered where it is
//!   detected, and the call keeps going.
//! - [`AppError`] is what HTTP handlers return. It implements actix's
//!   `ResponseError` so that a handler can use `?` and the client gets a
//!   consistent JSON body.
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "conflict",
//!     "message": "session already exists for call CA123",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Failures that can happen while a call is being processed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    /// An inbound frame could not be decoded; the frame is dropped.
    #[error("audio decode error: {0}")]
    Decode(String),

    /// The speech-to-text capability failed or timed out; the window is dropped.
    #[error("transcription failed: {0}")]
    Transcription(String),

    /// Neither the primary nor the fallback model produced a reply.
    #[error("no reply generated: {0}")]
    Generation(String),

    /// The synthesizer did not finish warming up within the allowed wait.
    #[error("speech synthesizer not ready after {0:?}")]
    SynthesisNotReady(Duration),

    #[error("speech synthesis failed: {0}")]
    Synthesis(String),

    /// An event referenced a call that has no live session.
    #[error("unknown call id: {0}")]
    UnknownCallId(String),

    #[error("session already exists for call {0}")]
    SessionExists(String),

    #[error("maximum concurrent calls ({0}) reached")]
    CapacityReached(usize),

    /// A turn was appended while the session was not accepting turns.
    #[error("session for call {call_id} is {state}, not active")]
    SessionNotActive { call_id: String, state: String },
}

impl PipelineError {
    /// Short machine-readable name, used as the `error` field of audit events.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Decode(_) => "decode_error",
            PipelineError::Transcription(_) => "transcription_error",
            PipelineError::Generation(_) => "generation_error",
            PipelineError::SynthesisNotReady(_) => "synthesis_not_ready",
            PipelineError::Synthesis(_) => "synthesis_error",
            PipelineError::UnknownCallId(_) => "unknown_call_id",
            PipelineError::SessionExists(_) => "session_exists",
            PipelineError::CapacityReached(_) => "capacity_reached",
            PipelineError::SessionNotActive { .. } => "session_not_active",
        }
    }
}

/// Errors returned by HTTP handlers.
///
/// ## HTTP Status Code Mapping:
/// - Internal/ConfigError → 500
/// - BadRequest/ValidationError → 400
/// - NotFound → 404
/// - Conflict → 409
/// - ServiceUnavailable → 503
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            AppError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg)
            }
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::UnknownCallId(_) => AppError::NotFound(err.to_string()),
            PipelineError::SessionExists(_) => AppError::Conflict(err.to_string()),
            PipelineError::CapacityReached(_) | PipelineError::SynthesisNotReady(_) => {
                AppError::ServiceUnavailable(err.to_string())
            }
            PipelineError::Decode(_) => AppError::BadRequest(err.to_string()),
            _ => AppError::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_errors_map_to_http_status() {
        let conflict: AppError = PipelineError::SessionExists("CA1".into()).into();
        assert_eq!(conflict.status_code(), StatusCode::CONFLICT);

        let missing: AppError = PipelineError::UnknownCallId("CA2".into()).into();
        assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);

        let busy: AppError = PipelineError::CapacityReached(2).into();
        assert_eq!(busy.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_error_kind_names() {
        assert_eq!(PipelineError::Decode("x".into()).kind(), "decode_error");
        assert_eq!(
            PipelineError::SynthesisNotReady(Duration::from_secs(60)).kind(),
            "synthesis_not_ready"
        );
    }

    #[test]
    fn test_error_response_body_shape() {
        let response = AppError::ValidationError("bad status".into()).error_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
