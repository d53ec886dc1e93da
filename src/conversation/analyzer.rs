//! Post-call analysis: condense a finished conversation into a [`CallSummary`].

use crate::conversation::generator::{ChatBackend, GenerationOptions};
use crate::conversation::session::{ConversationTurn, Role};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const ANALYST_INSTRUCTIONS: &str = "You are a healthcare data analyst extracting information from a phone \
conversation between a healthcare assistant and a patient about a FIT kit (colorectal cancer screening). \
Return a JSON object with exactly these fields: \
kit_completed (boolean or null), needs_new_kit (boolean or null), address_confirmed (boolean or null), \
callback_scheduled (boolean or null), callback_datetime (ISO 8601 string or null), address (string or null), \
language (string or null), comments (string, a brief summary of the key points), patient_reached (boolean). \
Use null for anything the conversation does not establish.";

/// Structured facts extracted from a completed call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallSummary {
    #[serde(default)]
    pub kit_completed: Option<bool>,
    #[serde(default)]
    pub needs_new_kit: Option<bool>,
    #[serde(default)]
    pub address_confirmed: Option<bool>,
    #[serde(default)]
    pub callback_scheduled: Option<bool>,
    #[serde(default)]
    pub callback_datetime: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub comments: String,
    #[serde(default = "reached")]
    pub patient_reached: bool,
}

fn reached() -> bool {
    true
}

impl CallSummary {
    fn unavailable(reason: &str) -> Self {
        Self {
            comments: format!("Error analyzing conversation: {}", reason),
            patient_reached: true,
            ..Self::default()
        }
    }

    /// Human-readable outcome line stored with the call record.
    pub fn outcome_text(&self) -> String {
        let mut outcome = format!("Call completed. Summary: {}", self.comments);
        if self.kit_completed == Some(true) {
            outcome.push_str(" Patient has completed the FIT kit.");
        } else if self.needs_new_kit == Some(true) {
            outcome.push_str(" Patient needs a new kit.");
        }
        if self.callback_scheduled == Some(true) {
            let when = self.callback_datetime.as_deref().unwrap_or("an unspecified time");
            outcome.push_str(&format!(" Callback scheduled for {}.", when));
        }
        outcome
    }
}

pub struct ConversationAnalyzer {
    backend: Arc<dyn ChatBackend>,
    timeout: Duration,
}

impl ConversationAnalyzer {
    pub fn new(backend: Arc<dyn ChatBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    /// Summarize a conversation. Never fails: problems end up in `comments`.
    pub async fn summarize(&self, history: &[ConversationTurn]) -> CallSummary {
        let conversation: String = history
            .iter()
            .filter(|turn| turn.role != Role::System)
            .map(|turn| format!("{}: {}\n\n", turn.role.as_str().to_uppercase(), turn.content))
            .collect();

        let request = vec![
            ConversationTurn::new(Role::System, ANALYST_INSTRUCTIONS),
            ConversationTurn::new(
                Role::User,
                format!("Please analyze this conversation about a FIT kit reminder:\n\n{}", conversation),
            ),
        ];
        let options = GenerationOptions {
            max_tokens: 400,
            temperature: 0.1,
            json_response: true,
        };

        let raw = match tokio::time::timeout(self.timeout, self.backend.complete(&request, &options)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                warn!("conversation analysis failed: {}", e);
                return CallSummary::unavailable(&e.to_string());
            }
            Err(_) => {
                warn!("conversation analysis timed out after {:?}", self.timeout);
                return CallSummary::unavailable("timed out");
            }
        };

        match serde_json::from_str::<CallSummary>(raw.trim()) {
            Ok(summary) => {
                info!(
                    kit_completed = ?summary.kit_completed,
                    needs_new_kit = ?summary.needs_new_kit,
                    callback_scheduled = ?summary.callback_scheduled,
                    "conversation summarized"
                );
                summary
            }
            Err(e) => {
                warn!("conversation summary was not valid JSON: {}", e);
                CallSummary::unavailable(&format!("invalid summary JSON: {}", e))
            }
        }
    }
}
