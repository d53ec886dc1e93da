//! Call scheduling, the status callback and the live call listing.
//!
//! `POST /call/start` only records who is about to be called; the session
//! itself is created when the media stream sends `start` for that number.

use crate::audit::{actions, AuditEvent, AuditEventType};
use crate::call::events::parse_status;
use crate::call::CallEvent;
use crate::conversation::{CallContext, PatientContext, ReminderKind};
use crate::error::{AppError, PipelineError};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
pub struct ScheduleCallRequest {
    pub to_number: String,
    #[serde(default)]
    pub reminder_kind: ReminderKind,
    #[serde(default)]
    pub patient: Option<PatientContext>,
}

/// Status callback as posted by the telephony provider.
///
/// Every field is optional so that a malformed callback is still answered
/// with 204 and never retried.
#[derive(Debug, Default, Deserialize)]
pub struct StatusCallback {
    #[serde(rename = "CallSid", default)]
    pub call_sid: String,
    #[serde(rename = "CallStatus", default)]
    pub call_status: String,
    #[serde(rename = "CallDuration", default)]
    pub call_duration: Option<String>,
}

pub async fn list_calls(state: web::Data<AppState>) -> HttpResponse {
    let calls = state.pipeline.registry().snapshots().await;

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "active": calls.len(),
        "capacity": state.pipeline.registry().capacity(),
        "calls": calls
    }))
}

pub async fn schedule_call(
    state: web::Data<AppState>,
    body: web::Json<ScheduleCallRequest>,
) -> Result<HttpResponse, AppError> {
    let request = body.into_inner();
    if !request.to_number.chars().any(|c| c.is_ascii_digit()) {
        return Err(AppError::ValidationError(format!(
            "to_number '{}' has no digits",
            request.to_number
        )));
    }

    let patient_ref = request.patient.as_ref().map(|p| p.patient_ref.clone());
    let context = CallContext {
        patient: request.patient,
        reminder_kind: request.reminder_kind,
    };
    let replaced = state
        .pipeline
        .directory()
        .schedule(&request.to_number, context)
        .is_some();

    state.pipeline.audit().record(
        AuditEvent::new(AuditEventType::PhiAccess, actions::CALL_SCHEDULED)
            .patient(patient_ref.as_deref())
            .details(json!({
                "reminder_kind": request.reminder_kind.as_str(),
                "replaced": replaced,
            })),
    );
    info!(
        reminder_kind = request.reminder_kind.as_str(),
        replaced,
        "call scheduled"
    );

    Ok(HttpResponse::Accepted().json(json!({
        "status": "scheduled",
        "reminder_kind": request.reminder_kind.as_str(),
        "replaced": replaced
    })))
}

pub async fn call_status(
    state: web::Data<AppState>,
    form: web::Form<StatusCallback>,
) -> HttpResponse {
    let callback = form.into_inner();
    let status = match parse_status(&callback.call_status) {
        Ok(status) => status,
        Err(e) => {
            warn!(call_id = %callback.call_sid, "status callback ignored: {}", e);
            return HttpResponse::NoContent().finish();
        }
    };
    let duration_seconds = callback
        .call_duration
        .as_deref()
        .and_then(|d| d.trim().parse::<u64>().ok());

    debug!(call_id = %callback.call_sid, status = %status, "status callback");
    match state.pipeline.handle_event(CallEvent::Status {
        call_id: callback.call_sid,
        status,
        duration_seconds,
    }) {
        Ok(()) | Err(PipelineError::UnknownCallId(_)) => {}
        Err(e) => warn!("status callback failed: {}", e),
    }

    HttpResponse::NoContent().finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::test_state;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use std::time::Duration;

    fn routes(cfg: &mut web::ServiceConfig) {
        cfg.route("/call/start", web::post().to(schedule_call))
            .route("/call/status", web::post().to(call_status))
            .route("/calls", web::get().to(list_calls));
    }

    #[actix_web::test]
    async fn test_schedule_call_is_used_by_the_next_start() {
        let fixture = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(fixture.state.clone()))
                .configure(routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/call/start")
            .set_json(json!({
                "to_number": "+1 (555) 010-2000",
                "reminder_kind": "fit_kit",
                "patient": {"patient_ref": "mrn-42", "name": "Ana"}
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(fixture.audit.count(actions::CALL_SCHEDULED), 1);

        let handle = fixture
            .state
            .pipeline
            .start_call("CA1", Some("+15550102000"))
            .unwrap();
        let session = handle.session().lock().await;
        assert_eq!(session.patient_ref(), Some("mrn-42"));
        assert_eq!(session.context().reminder_kind, ReminderKind::FitKit);
    }

    #[actix_web::test]
    async fn test_schedule_call_rejects_number_without_digits() {
        let fixture = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(fixture.state.clone()))
                .configure(routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/call/start")
            .set_json(json!({"to_number": "unknown"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(fixture.state.pipeline.directory().pending(), 0);
    }

    #[actix_web::test]
    async fn test_status_callback_tears_down_and_lists_calls() {
        let fixture = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(fixture.state.clone()))
                .configure(routes),
        )
        .await;
        fixture.state.pipeline.start_call("CA7", None).unwrap();

        let req = test::TestRequest::get().uri("/calls").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["active"], 1);
        assert_eq!(body["calls"][0]["call_id"], "CA7");

        let req = test::TestRequest::post()
            .uri("/call/status")
            .set_form([("CallSid", "CA7"), ("CallStatus", "busy"), ("CallDuration", "0")])
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        for _ in 0..100 {
            if fixture.state.active_calls() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fixture.state.active_calls(), 0);
        let outcome = fixture.store.get("CA7").unwrap();
        assert_eq!(outcome.status, "busy");
        assert_eq!(outcome.outcome, "Call busy. Patient not reached.");
    }

    #[actix_web::test]
    async fn test_status_callback_always_answers_no_content() {
        let fixture = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(fixture.state.clone()))
                .configure(routes),
        )
        .await;

        for form in [
            vec![("CallSid", "CA404"), ("CallStatus", "completed")],
            vec![("CallSid", "CA1"), ("CallStatus", "teleported")],
            vec![],
        ] {
            let req = test::TestRequest::post()
                .uri("/call/status")
                .set_form(form)
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        }
    }
}
