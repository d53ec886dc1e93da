//! # Pipeline Metrics
//!
//! Process-wide counters for the call pipeline, exposed on `/api/v1/metrics`.
//!
//! ## Locking:
//! One `parking_lot::RwLock` around a plain struct. Every update is a handful
//! of integer additions, so writers never hold the lock across an await.

use parking_lot::RwLock;
use serde::Serialize;

/// Counters collected since process start.
#[derive(Debug, Default, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub calls_started: u64,
    pub calls_closed: u64,
    pub calls_rejected: u64,
    pub frames_received: u64,
    /// Frames that failed to decode and were dropped
    pub frames_dropped: u64,
    pub windows_transcribed: u64,
    pub utterances: u64,
    /// Windows whose transcript was empty after trimming
    pub empty_transcripts: u64,
    pub transcription_failures: u64,
    pub replies: u64,
    /// Replies that came from the fallback model
    pub fallback_replies: u64,
    pub generation_failures: u64,
    pub greeting_fallbacks: u64,
    pub synthesized_replies: u64,
    pub synthesis_not_ready: u64,
    pub synthesis_failures: u64,
    /// Events for calls that have no live session
    pub ignored_events: u64,
    pub outcome_save_failures: u64,
}

impl MetricsSnapshot {
    /// Fraction of transcription attempts that failed (0.0 to 1.0).
    pub fn transcription_error_rate(&self) -> f64 {
        let attempts = self.windows_transcribed + self.transcription_failures;
        if attempts > 0 {
            self.transcription_failures as f64 / attempts as f64
        } else {
            0.0
        }
    }
}

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    counters: RwLock<MetricsSnapshot>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an update under the write lock.
    pub fn record(&self, update: impl FnOnce(&mut MetricsSnapshot)) {
        update(&mut self.counters.write());
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.counters.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let metrics = PipelineMetrics::new();
        metrics.record(|m| m.calls_started += 1);
        metrics.record(|m| {
            m.windows_transcribed += 3;
            m.transcription_failures += 1;
        });

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.calls_started, 1);
        assert_eq!(snapshot.transcription_error_rate(), 0.25);
    }
}
