//! # Conversation Session
//!
//! Per-call conversational state: who we are calling, why, and everything that
//! has been said so far.
//!
//! ## Session Lifecycle:
//! 1. **Created**: System turn built from the call context, greeting pending
//! 2. **Active**: Greeting appended; user and assistant turns accumulate
//! 3. **Closing**: Terminal call status received; outcome being persisted
//! 4. **Closed**: Persistence finished; the registry forgets the call
//!
//! ## History invariants:
//! - `history[0]` is always the system turn built at creation
//! - Turns are only ever appended, never edited, removed or reordered

use crate::conversation::instructions::build_system_instructions;
use crate::error::PipelineError;
use crate::synthesis::SpeechSynthesizer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &str {
        match self {
            SessionState::Created => "created",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

/// Why the call is being placed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderKind {
    #[default]
    FitKit,
    SecondReminder,
    Medication,
    General,
}

impl ReminderKind {
    pub fn is_kit_reminder(&self) -> bool {
        matches!(self, ReminderKind::FitKit | ReminderKind::SecondReminder)
    }

    pub fn as_str(&self) -> &str {
        match self {
            ReminderKind::FitKit => "fit_kit",
            ReminderKind::SecondReminder => "second_reminder",
            ReminderKind::Medication => "medication",
            ReminderKind::General => "general",
        }
    }
}

/// What our records say about the patient's kit before the call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KitStatus {
    pub prior_letter: bool,
    pub reminder_sent: bool,
    pub needs_new_kit: bool,
    pub address_confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientContext {
    /// MRN or MRN hash; the only identifier that reaches audit events
    pub patient_ref: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub kit_status: KitStatus,
}

/// Everything known about a call before the patient picks up.
///
/// The default is an unscheduled call: no patient record and a general
/// follow-up conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallContext {
    pub patient: Option<PatientContext>,
    pub reminder_kind: ReminderKind,
}

impl Default for CallContext {
    fn default() -> Self {
        Self {
            patient: None,
            reminder_kind: ReminderKind::General,
        }
    }
}

pub struct ConversationSession {
    call_id: String,
    context: CallContext,
    history: Vec<ConversationTurn>,
    transcript: String,
    created_at: DateTime<Utc>,
    state: SessionState,
    /// Attached on first use, never replaced
    synthesizer: Option<Arc<SpeechSynthesizer>>,
}

impl ConversationSession {
    /// Create a session in the `Created` state with its system turn.
    pub fn new(call_id: impl Into<String>, context: CallContext) -> Self {
        let system = build_system_instructions(&context);
        Self {
            call_id: call_id.into(),
            context,
            history: vec![ConversationTurn::new(Role::System, system)],
            transcript: String::new(),
            created_at: Utc::now(),
            state: SessionState::Created,
            synthesizer: None,
        }
    }

    /// Append the opening line and start accepting turns.
    pub fn activate(&mut self, greeting: &str) -> Result<(), PipelineError> {
        if self.state != SessionState::Created {
            return Err(self.not_active());
        }
        self.push(Role::Assistant, greeting);
        self.state = SessionState::Active;
        Ok(())
    }

    pub fn append_user(&mut self, text: &str) -> Result<(), PipelineError> {
        self.require_active()?;
        self.push(Role::User, text);
        Ok(())
    }

    pub fn append_assistant(&mut self, text: &str) -> Result<(), PipelineError> {
        self.require_active()?;
        self.push(Role::Assistant, text);
        Ok(())
    }

    /// Add an extra system turn mid-call (e.g. a record lookup result).
    pub fn add_context(&mut self, text: &str) -> Result<(), PipelineError> {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return Err(self.not_active());
        }
        self.history.push(ConversationTurn::new(
            Role::System,
            format!("Additional context: {}", text),
        ));
        Ok(())
    }

    /// Move to `Closing`. Returns false if the session was already closing.
    pub fn begin_closing(&mut self) -> bool {
        match self.state {
            SessionState::Created | SessionState::Active => {
                self.state = SessionState::Closing;
                true
            }
            SessionState::Closing | SessionState::Closed => false,
        }
    }

    /// Move from `Closing` to `Closed`.
    pub fn close(&mut self) -> bool {
        if self.state == SessionState::Closing {
            self.state = SessionState::Closed;
            true
        } else {
            false
        }
    }

    /// Attach the synthesizer used for this call. Only the first call wins.
    pub fn attach_synthesizer(&mut self, synthesizer: Arc<SpeechSynthesizer>) -> bool {
        if self.synthesizer.is_some() {
            return false;
        }
        self.synthesizer = Some(synthesizer);
        true
    }

    pub fn synthesizer(&self) -> Option<&Arc<SpeechSynthesizer>> {
        self.synthesizer.as_ref()
    }

    pub fn context(&self) -> &CallContext {
        &self.context
    }

    pub fn patient_ref(&self) -> Option<&str> {
        self.context.patient.as_ref().map(|p| p.patient_ref.as_str())
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    /// Plain-text transcript, one `Patient:`/`Assistant:` line per turn.
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn user_turns(&self) -> usize {
        self.history.iter().filter(|t| t.role == Role::User).count()
    }

    fn push(&mut self, role: Role, text: &str) {
        let speaker = match role {
            Role::User => "Patient",
            _ => "Assistant",
        };
        self.transcript.push_str(&format!("{}: {}\n", speaker, text));
        self.history.push(ConversationTurn::new(role, text));
    }

    fn require_active(&self) -> Result<(), PipelineError> {
        if self.state == SessionState::Active {
            Ok(())
        } else {
            Err(self.not_active())
        }
    }

    fn not_active(&self) -> PipelineError {
        PipelineError::SessionNotActive {
            call_id: self.call_id.clone(),
            state: self.state.as_str().to_string(),
        }
    }
}
