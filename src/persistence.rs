//! # Call Outcome Persistence
//!
//! The record of a finished call is handed to an [`OutcomeStore`] exactly
//! through `save_call_outcome(call_id, outcome)`. Saving the same call twice
//! replaces the earlier record, so a retried status callback cannot create
//! duplicates.
//!
//! ## Implementations:
//! - [`JsonFileOutcomeStore`]: one `{call_id}.json` file per call
//! - [`InMemoryOutcomeStore`]: process memory, used when no directory is configured

use crate::conversation::CallSummary;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Everything kept about a call once it has ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallOutcome {
    pub call_id: String,
    pub patient_ref: Option<String>,
    /// Terminal status reported by the telephony provider
    pub status: String,
    pub duration_seconds: Option<u64>,
    pub outcome: String,
    pub summary: Option<CallSummary>,
    pub transcript: String,
    pub turn_count: usize,
    pub ended_at: DateTime<Utc>,
}

#[async_trait]
pub trait OutcomeStore: Send + Sync {
    /// Store the outcome of `call_id`, replacing any earlier record.
    async fn save_call_outcome(&self, call_id: &str, outcome: &CallOutcome) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryOutcomeStore {
    outcomes: RwLock<HashMap<String, CallOutcome>>,
}

impl InMemoryOutcomeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl InMemoryOutcomeStore {
    pub fn get(&self, call_id: &str) -> Option<CallOutcome> {
        self.outcomes.read().get(call_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.outcomes.read().len()
    }
}

#[async_trait]
impl OutcomeStore for InMemoryOutcomeStore {
    async fn save_call_outcome(&self, call_id: &str, outcome: &CallOutcome) -> Result<()> {
        self.outcomes
            .write()
            .insert(call_id.to_string(), outcome.clone());
        Ok(())
    }
}

/// Writes each outcome as pretty-printed JSON into a directory.
pub struct JsonFileOutcomeStore {
    dir: PathBuf,
}

impl JsonFileOutcomeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create outcome directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, call_id: &str) -> PathBuf {
        // Call ids come from the telephony provider; keep them to one path segment
        let name: String = call_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", name))
    }
}

#[async_trait]
impl OutcomeStore for JsonFileOutcomeStore {
    async fn save_call_outcome(&self, call_id: &str, outcome: &CallOutcome) -> Result<()> {
        let path = self.path_for(call_id);
        let body = serde_json::to_vec_pretty(outcome)?;

        // Write then rename so a reader never sees a half-written record
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, body)
            .await
            .with_context(|| format!("failed to write {}", staging.display()))?;
        tokio::fs::rename(&staging, &path)
            .await
            .with_context(|| format!("failed to move outcome into {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn outcome(call_id: &str, text: &str) -> CallOutcome {
        CallOutcome {
            call_id: call_id.to_string(),
            patient_ref: Some("MRN-1".to_string()),
            status: "completed".to_string(),
            duration_seconds: Some(42),
            outcome: text.to_string(),
            summary: None,
            transcript: "Assistant: Hello\n".to_string(),
            turn_count: 2,
            ended_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_saving_twice_keeps_one_record() {
        let store = InMemoryOutcomeStore::new();
        store.save_call_outcome("CA1", &outcome("CA1", "first")).await.unwrap();
        store.save_call_outcome("CA1", &outcome("CA1", "second")).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("CA1").unwrap().outcome, "second");
    }

    #[tokio::test]
    async fn test_file_store_overwrites_in_place() {
        let dir = std::env::temp_dir().join(format!("outcomes-{}", Uuid::new_v4()));
        let store = JsonFileOutcomeStore::new(&dir).unwrap();

        store.save_call_outcome("CA/../9", &outcome("CA/../9", "first")).await.unwrap();
        store.save_call_outcome("CA/../9", &outcome("CA/../9", "second")).await.unwrap();

        let files: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
        assert_eq!(files.len(), 1);

        let saved: CallOutcome =
            serde_json::from_slice(&std::fs::read(store.path_for("CA/../9")).unwrap()).unwrap();
        assert_eq!(saved.outcome, "second");
        assert!(store.path_for("CA/../9").starts_with(&dir));

        std::fs::remove_dir_all(dir).ok();
    }
}
