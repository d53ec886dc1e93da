//! Inbound call events, independent of any telephony vendor's wire format.

use crate::audio::AudioFrame;
use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status reported by the telephony provider for a call leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    Queued,
    Ringing,
    InProgress,
    Completed,
    Failed,
    Busy,
    NoAnswer,
    Canceled,
}

impl CallStatus {
    /// Terminal statuses end the call and trigger teardown.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Completed
                | CallStatus::Failed
                | CallStatus::Busy
                | CallStatus::NoAnswer
                | CallStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Queued => "queued",
            CallStatus::Ringing => "ringing",
            CallStatus::InProgress => "in-progress",
            CallStatus::Completed => "completed",
            CallStatus::Failed => "failed",
            CallStatus::Busy => "busy",
            CallStatus::NoAnswer => "no-answer",
            CallStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "queued" | "initiated" => Ok(CallStatus::Queued),
            "ringing" => Ok(CallStatus::Ringing),
            "in-progress" | "answered" => Ok(CallStatus::InProgress),
            "completed" => Ok(CallStatus::Completed),
            "failed" => Ok(CallStatus::Failed),
            "busy" => Ok(CallStatus::Busy),
            "no-answer" => Ok(CallStatus::NoAnswer),
            "canceled" | "cancelled" => Ok(CallStatus::Canceled),
            other => Err(format!("unknown call status '{}'", other)),
        }
    }
}

/// One event on the inbound side of a call.
#[derive(Debug, Clone)]
pub enum CallEvent {
    Start {
        call_id: String,
        to_number: Option<String>,
    },
    Media {
        call_id: String,
        frame: AudioFrame,
    },
    /// End of the inbound audio stream
    Stop { call_id: String },
    Status {
        call_id: String,
        status: CallStatus,
        duration_seconds: Option<u64>,
    },
}

impl CallEvent {
    pub fn call_id(&self) -> &str {
        match self {
            CallEvent::Start { call_id, .. }
            | CallEvent::Media { call_id, .. }
            | CallEvent::Stop { call_id }
            | CallEvent::Status { call_id, .. } => call_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CallEvent::Start { .. } => "start",
            CallEvent::Media { .. } => "media",
            CallEvent::Stop { .. } => "stop",
            CallEvent::Status { .. } => "status",
        }
    }
}

/// Parse a status string from an untrusted source into a pipeline error.
pub fn parse_status(value: &str) -> Result<CallStatus, PipelineError> {
    value.parse::<CallStatus>().map_err(PipelineError::Decode)
}
