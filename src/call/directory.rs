//! Scheduled-call directory.
//!
//! `/call/start` records who is being called and why, keyed by the
//! destination number. When the telephony leg connects, the `start` event
//! carries that number and the pipeline takes the matching context. Each
//! entry is consumed once. Entries whose call never connects expire after
//! the configured time to live.

use crate::conversation::CallContext;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default lifetime of an unclaimed entry.
pub const DEFAULT_SCHEDULE_TTL: Duration = Duration::from_secs(3600);

struct Scheduled {
    context: CallContext,
    scheduled_at: Instant,
}

pub struct CallDirectory {
    scheduled: Mutex<HashMap<String, Scheduled>>,
    ttl: Duration,
}

impl Default for CallDirectory {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_SCHEDULE_TTL)
    }
}

impl CallDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            scheduled: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Remember the context for the next call to `to_number`, replacing any
    /// earlier live entry for the same number.
    pub fn schedule(&self, to_number: &str, context: CallContext) -> Option<CallContext> {
        let mut scheduled = self.scheduled.lock();
        self.evict_expired(&mut scheduled);
        scheduled
            .insert(
                normalize(to_number),
                Scheduled {
                    context,
                    scheduled_at: Instant::now(),
                },
            )
            .map(|previous| previous.context)
    }

    /// Take the context scheduled for `to_number`, if any and not expired.
    pub fn take(&self, to_number: &str) -> Option<CallContext> {
        let mut scheduled = self.scheduled.lock();
        self.evict_expired(&mut scheduled);
        scheduled.remove(&normalize(to_number)).map(|entry| entry.context)
    }

    pub fn pending(&self) -> usize {
        let mut scheduled = self.scheduled.lock();
        self.evict_expired(&mut scheduled);
        scheduled.len()
    }

    fn evict_expired(&self, scheduled: &mut HashMap<String, Scheduled>) {
        let before = scheduled.len();
        scheduled.retain(|_, entry| entry.scheduled_at.elapsed() < self.ttl);
        let evicted = before - scheduled.len();
        if evicted > 0 {
            debug!(evicted, "expired scheduled calls dropped");
        }
    }
}

/// Keep digits and a leading `+`, so `(555) 010-0199` and `555-010-0199` match.
fn normalize(number: &str) -> String {
    let trimmed = number.trim();
    let mut normalized: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if trimmed.starts_with('+') {
        normalized.insert(0, '+');
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{PatientContext, ReminderKind};

    fn context(patient_ref: &str) -> CallContext {
        CallContext {
            patient: Some(PatientContext {
                patient_ref: patient_ref.to_string(),
                name: Some("Maria".to_string()),
                phone_number: Some("+1 (555) 010-0199".to_string()),
                kit_status: Default::default(),
            }),
            reminder_kind: ReminderKind::FitKit,
        }
    }

    #[test]
    fn test_entries_are_consumed_once() {
        let directory = CallDirectory::new();
        directory.schedule("+1 (555) 010-0199", context("MRN-1"));

        let taken = directory.take("+15550100199").unwrap();
        assert_eq!(taken.patient.unwrap().patient_ref, "MRN-1");
        assert!(directory.take("+15550100199").is_none());
        assert_eq!(directory.pending(), 0);
    }

    #[test]
    fn test_rescheduling_replaces_entry() {
        let directory = CallDirectory::new();
        assert!(directory.schedule("5550100199", context("MRN-1")).is_none());
        assert!(directory.schedule("555-010-0199", context("MRN-2")).is_some());
        assert_eq!(directory.pending(), 1);
    }

    #[test]
    fn test_unclaimed_entries_expire() {
        let directory = CallDirectory::with_ttl(Duration::from_millis(20));
        for i in 0..10 {
            directory.schedule(&format!("+1555010{:04}", i), context("MRN-1"));
        }
        assert_eq!(directory.pending(), 10);

        std::thread::sleep(Duration::from_millis(40));
        assert!(directory.take("+15550100003").is_none());
        assert_eq!(directory.pending(), 0);

        // Fresh entries are unaffected by the sweep
        directory.schedule("+15550100199", context("MRN-2"));
        let taken = directory.take("+15550100199").unwrap();
        assert_eq!(taken.patient.unwrap().patient_ref, "MRN-2");
    }
}
