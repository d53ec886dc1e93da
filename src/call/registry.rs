//! # Session Registry
//!
//! Process-wide map from call id to the live [`CallHandle`] of that call.
//!
//! ## Locking:
//! One `parking_lot::RwLock` around the map. It is held only for the map
//! operation itself and never across an await, so a slow call can never
//! block lookups for the others. Each handle carries its own async lock for
//! the conversation session.

use crate::audio::AudioFrame;
use crate::cancel::{cancel_pair, CancelHandle, CancelToken};
use crate::conversation::{CallContext, ConversationSession, SessionState};
use crate::error::PipelineError;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Everything the process holds for one live call.
pub struct CallHandle {
    call_id: String,
    session: tokio::sync::Mutex<ConversationSession>,
    /// Inbound frames; taken away when the stream ends
    frames: Mutex<Option<mpsc::Sender<AudioFrame>>>,
    inbox: Mutex<Option<mpsc::Receiver<AudioFrame>>>,
    cancel: CancelHandle,
    task: Mutex<Option<JoinHandle<()>>>,
    started: Instant,
}

impl CallHandle {
    fn new(call_id: &str, context: CallContext, frame_queue: usize) -> Self {
        let (frames, inbox) = mpsc::channel(frame_queue.max(1));
        let (cancel, _) = cancel_pair();
        Self {
            call_id: call_id.to_string(),
            session: tokio::sync::Mutex::new(ConversationSession::new(call_id, context)),
            frames: Mutex::new(Some(frames)),
            inbox: Mutex::new(Some(inbox)),
            cancel,
            task: Mutex::new(None),
            started: Instant::now(),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn session(&self) -> &tokio::sync::Mutex<ConversationSession> {
        &self.session
    }

    /// Queue an inbound frame without waiting.
    ///
    /// Returns false when the frame was dropped: the queue is full, or the
    /// stream has already ended.
    pub fn offer_frame(&self, frame: AudioFrame) -> bool {
        match self.frames.lock().as_ref() {
            Some(frames) => frames.try_send(frame).is_ok(),
            None => false,
        }
    }

    /// Close the inbound stream; the ingest task flushes what it has buffered.
    pub fn end_stream(&self) -> bool {
        self.frames.lock().take().is_some()
    }

    /// Receiver side of the frame queue. Only the first caller gets it.
    pub fn take_inbox(&self) -> Option<mpsc::Receiver<AudioFrame>> {
        self.inbox.lock().take()
    }

    pub fn token(&self) -> CancelToken {
        self.cancel.token()
    }

    /// Signal every task of this call to stop and close the inbound stream.
    pub fn cancel(&self) {
        self.end_stream();
        self.cancel.cancel();
    }

    pub fn set_task(&self, task: JoinHandle<()>) {
        *self.task.lock() = Some(task);
    }

    pub fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().take()
    }

    pub fn age_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

/// Snapshot of one call for the `/api/v1/calls` listing.
#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub call_id: String,
    pub state: SessionState,
    pub patient_ref: Option<String>,
    pub reminder_kind: String,
    pub turns: usize,
    pub started_at: DateTime<Utc>,
    pub age_seconds: u64,
}

pub struct SessionRegistry {
    calls: RwLock<HashMap<String, Arc<CallHandle>>>,
    max_sessions: usize,
    frame_queue: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize, frame_queue: usize) -> Self {
        Self {
            calls: RwLock::new(HashMap::new()),
            max_sessions,
            frame_queue,
        }
    }

    /// Register a new call.
    ///
    /// ## Errors:
    /// - `SessionExists` if `call_id` is already registered
    /// - `CapacityReached` if the concurrent call limit is reached
    pub fn create(&self, call_id: &str, context: CallContext) -> Result<Arc<CallHandle>, PipelineError> {
        // Built outside the lock: constructing the session renders instructions
        let handle = Arc::new(CallHandle::new(call_id, context, self.frame_queue));

        let mut calls = self.calls.write();
        if calls.contains_key(call_id) {
            return Err(PipelineError::SessionExists(call_id.to_string()));
        }
        if calls.len() >= self.max_sessions {
            return Err(PipelineError::CapacityReached(self.max_sessions));
        }
        calls.insert(call_id.to_string(), handle.clone());
        Ok(handle)
    }

    pub fn get(&self, call_id: &str) -> Option<Arc<CallHandle>> {
        self.calls.read().get(call_id).cloned()
    }

    pub fn remove(&self, call_id: &str) -> Option<Arc<CallHandle>> {
        self.calls.write().remove(call_id)
    }

    pub fn active_call_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.calls.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.calls.read().len()
    }

    pub fn capacity(&self) -> usize {
        self.max_sessions
    }

    /// Describe every live call. Handles are collected first so that no
    /// session lock is taken while the map is locked.
    pub async fn snapshots(&self) -> Vec<CallSnapshot> {
        let handles: Vec<Arc<CallHandle>> = self.calls.read().values().cloned().collect();

        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            let session = handle.session().lock().await;
            snapshots.push(CallSnapshot {
                call_id: handle.call_id().to_string(),
                state: session.state(),
                patient_ref: session.patient_ref().map(str::to_string),
                reminder_kind: session.context().reminder_kind.as_str().to_string(),
                turns: session.history().len(),
                started_at: session.created_at(),
                age_seconds: handle.age_seconds(),
            });
        }
        snapshots.sort_by(|a, b| a.call_id.cmp(&b.call_id));
        snapshots
    }
}
