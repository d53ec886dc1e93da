//! # Conversation Module
//!
//! The talking half of a call: session state, the system instructions that
//! steer the model, reply generation with fallback, and post-call analysis.

pub mod analyzer;
pub mod generator;
pub mod instructions;
pub mod session;

pub use analyzer::{CallSummary, ConversationAnalyzer};
pub use generator::{Reply, ResponseGenerator};
pub use session::{CallContext, ConversationSession, PatientContext, ReminderKind, SessionState};
