//! # Audit Trail
//!
//! Every action that touches patient information produces an [`AuditEvent`].
//! Call code only knows the [`AuditSink`] trait; where the events end up is
//! decided once in `main`:
//!
//! - [`TracingAuditSink`]: one structured log line per event on the `audit` target
//! - [`JsonlAuditSink`]: the same line, plus one JSON object per line appended to
//!   `audit_YYYYMMDD.jsonl` in the configured directory by a background writer task
//!
//! ## Events emitted by the call pipeline:
//! session created, utterance finalized, reply generated, greeting fallback,
//! transcription/generation/synthesis failures, conversation analysis and
//! outcome persistence failures, session closed, and call scheduling (PHI access).

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Action names used across the pipeline.
pub mod actions {
    pub const CALL_SCHEDULED: &str = "CALL_SCHEDULED";
    pub const SESSION_CREATED: &str = "SESSION_CREATED";
    pub const GREETING_FALLBACK: &str = "GREETING_FALLBACK";
    pub const UTTERANCE_FINALIZED: &str = "UTTERANCE_FINALIZED";
    pub const REPLY_GENERATED: &str = "REPLY_GENERATED";
    pub const TRANSCRIPTION_FAILED: &str = "TRANSCRIPTION_FAILED";
    pub const GENERATION_FAILED: &str = "GENERATION_FAILED";
    pub const SYNTHESIS_FAILED: &str = "SYNTHESIS_FAILED";
    pub const CONVERSATION_ANALYZED: &str = "CONVERSATION_ANALYZED";
    pub const OUTCOME_SAVE_FAILED: &str = "OUTCOME_SAVE_FAILED";
    pub const SESSION_CLOSED: &str = "SESSION_CLOSED";
}

/// Category of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    /// Patient-identifying data was read or shared with a capability
    PhiAccess,
    /// A step of a patient call
    PatientCall,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Success,
    Failure,
}

/// One audit record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub event_type: AuditEventType,
    pub action: String,
    pub call_id: Option<String>,
    pub patient_ref: Option<String>,
    pub status: AuditStatus,
    pub details: Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, action: &str) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            action: action.to_string(),
            call_id: None,
            patient_ref: None,
            status: AuditStatus::Success,
            details: Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn call(mut self, call_id: &str) -> Self {
        self.call_id = Some(call_id.to_string());
        self
    }

    pub fn patient(mut self, patient_ref: Option<&str>) -> Self {
        self.patient_ref = patient_ref.map(str::to_string);
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn failed(mut self) -> Self {
        self.status = AuditStatus::Failure;
        self
    }
}

/// Destination for audit events.
///
/// `record` must not block for long: it is called from inside the per-call
/// tasks, between audio frames.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes audit events to the tracing output.
#[derive(Debug, Default, Clone)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        log_event(&event);
    }
}

fn log_event(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(line) => info!(target: "audit", action = %event.action, "AUDIT|{}", line),
        Err(e) => warn!(target: "audit", action = %event.action, "unserializable audit event: {}", e),
    }
}

/// Appends audit events to a daily JSON-lines file.
///
/// `record` only queues the event; a single writer task owns the file and
/// appends lines in the order they were recorded. Must be created inside a
/// Tokio runtime.
pub struct JsonlAuditSink {
    queue: mpsc::UnboundedSender<AuditEvent>,
}

impl JsonlAuditSink {
    /// Create the sink, making sure the directory exists, and start its writer.
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let (queue, events) = mpsc::unbounded_channel();
        tokio::spawn(write_events(dir, events));
        Ok(Self { queue })
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, event: AuditEvent) {
        log_event(&event);
        if let Err(rejected) = self.queue.send(event) {
            warn!(target: "audit", action = %rejected.0.action, "audit writer stopped, event not written to file");
        }
    }
}

fn audit_file_path(dir: &Path, timestamp: &DateTime<Utc>) -> PathBuf {
    dir.join(format!("audit_{}.jsonl", timestamp.format("%Y%m%d")))
}

/// Writer loop. Keeps the current day's file open and switches when an
/// event carries a new date. Ends when every sender is dropped.
async fn write_events(dir: PathBuf, mut events: mpsc::UnboundedReceiver<AuditEvent>) {
    let mut current: Option<(PathBuf, File)> = None;

    while let Some(event) = events.recv().await {
        let path = audit_file_path(&dir, &event.timestamp);
        if let Err(e) = append_line(&mut current, path, &event).await {
            warn!(target: "audit", action = %event.action, "failed to append audit event: {}", e);
            current = None;
        }
    }
    debug!(target: "audit", "audit writer stopped");
}

async fn append_line(
    current: &mut Option<(PathBuf, File)>,
    path: PathBuf,
    event: &AuditEvent,
) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');

    let reopen = !matches!(&*current, Some((open, _)) if *open == path);
    if reopen {
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        *current = Some((path, file));
    }

    match current.as_mut() {
        Some((_, file)) => {
            file.write_all(&line).await?;
            file.flush().await
        }
        None => Ok(()),
    }
}

/// Keeps events in memory so tests can assert on them.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryAuditSink {
    events: parking_lot::Mutex<Vec<AuditEvent>>,
}

#[cfg(test)]
impl MemoryAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.action.clone()).collect()
    }

    pub fn count(&self, action: &str) -> usize {
        self.events.lock().iter().filter(|e| e.action == action).count()
    }
}

#[cfg(test)]
impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}
