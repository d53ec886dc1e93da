//! System instructions and greeting prompts for reminder calls.

use crate::conversation::session::{CallContext, ReminderKind};

/// Spoken when the greeting cannot be generated.
pub const STATIC_GREETING: &str =
    "Hello, this is your healthcare assistant calling with a reminder. How are you doing today?";

const BASE: &str = "You are a friendly healthcare assistant making a HIPAA-compliant phone call. \
Be conversational, empathetic and brief: every reply is spoken aloud, so keep it to one or two sentences. \
Do not ask for or confirm identifying information beyond what the reminder needs. \
Answer basic questions but defer medical questions to the patient's doctor.";

const FIT_KIT_GOALS: &str = "Your goal is to determine: \
1. Whether they have completed and mailed back their FIT kit. If yes, thank them. \
2. If not, whether they still have the kit and whether they need help using it. \
3. If they need a new kit, offer to mail one and confirm the mailing address. \
4. If they have difficulties or questions, offer a callback with a healthcare provider. \
The FIT kit is a simple at-home test that detects hidden blood in the stool, which can be an early sign of colorectal cancer or polyps.";

const CLOSING: &str = "If they ask to speak with a healthcare provider, offer to schedule a callback and ask what time works best. \
End the call politely, thank them for their time and reinforce why the screening matters for their health.";

/// Build the system turn that opens every conversation.
pub fn build_system_instructions(context: &CallContext) -> String {
    let mut parts: Vec<String> = vec![BASE.to_string()];

    if let Some(name) = context.patient.as_ref().and_then(|p| p.name.as_deref()) {
        parts.push(format!("You are calling {}.", name));
    }

    parts.push(
        match context.reminder_kind {
            ReminderKind::FitKit => {
                "This is a reminder call about their FIT kit (Fecal Immunochemical Test) for colorectal cancer screening."
            }
            ReminderKind::SecondReminder => {
                "This is a SECOND reminder call about their FIT kit. Our records show they have not completed or returned it after the first reminder."
            }
            ReminderKind::Medication => {
                "This is a medication reminder call. Check whether they have taken their medication today."
            }
            ReminderKind::General => "This is a general healthcare follow-up call.",
        }
        .to_string(),
    );

    if context.reminder_kind.is_kit_reminder() {
        parts.push(FIT_KIT_GOALS.to_string());
    }

    if let Some(status) = context.patient.as_ref().map(|p| &p.kit_status) {
        if status.prior_letter {
            parts.push("Our records show a letter was sent about completing this test.".to_string());
        }
        if status.reminder_sent {
            parts.push("They have been called previously about completing the FIT kit.".to_string());
        }
        if status.needs_new_kit {
            parts.push("Our records indicate they might need a new kit.".to_string());
        }
        if !status.address_confirmed && context.reminder_kind.is_kit_reminder() {
            parts.push(
                "Confirm their mailing address only if they need a new kit or have not returned the kit yet."
                    .to_string(),
            );
        }
    }

    parts.push(CLOSING.to_string());
    parts.join("\n\n")
}

/// Transient instruction used to produce the opening line of the call.
pub fn greeting_instruction(kind: ReminderKind) -> &'static str {
    match kind {
        ReminderKind::Medication => {
            "Generate a brief, friendly greeting for a medication reminder call. Introduce yourself as a healthcare assistant calling to check if they've taken their medication today."
        }
        ReminderKind::FitKit | ReminderKind::SecondReminder => {
            "Generate a brief, friendly greeting for a call about a FIT kit (colorectal cancer screening). Introduce yourself as a healthcare assistant calling to check if they've completed and returned their kit."
        }
        ReminderKind::General => {
            "Generate a brief, friendly greeting for a healthcare follow-up call. Introduce yourself as a healthcare assistant."
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::session::{KitStatus, PatientContext};

    fn context(kind: ReminderKind, kit_status: KitStatus) -> CallContext {
        CallContext {
            patient: Some(PatientContext {
                patient_ref: "MRN-42".to_string(),
                name: Some("Alex".to_string()),
                phone_number: None,
                kit_status,
            }),
            reminder_kind: kind,
        }
    }

    #[test]
    fn test_second_reminder_mentions_prior_attempt() {
        let text = build_system_instructions(&context(
            ReminderKind::SecondReminder,
            KitStatus {
                reminder_sent: true,
                ..KitStatus::default()
            },
        ));
        assert!(text.contains("SECOND reminder"));
        assert!(text.contains("You are calling Alex."));
        assert!(text.contains("called previously"));
        assert!(text.contains("mailing address"));
    }

    #[test]
    fn test_confirmed_address_is_not_requested() {
        let text = build_system_instructions(&context(
            ReminderKind::FitKit,
            KitStatus {
                address_confirmed: true,
                ..KitStatus::default()
            },
        ));
        assert!(!text.contains("Confirm their mailing address only"));
    }

    #[test]
    fn test_general_call_without_patient() {
        let text = build_system_instructions(&CallContext::default());
        assert!(text.contains("general healthcare follow-up"));
        assert!(!text.contains("You are calling"));
        assert!(!text.contains("Your goal is to determine"));
    }
}
