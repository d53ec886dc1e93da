use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Current configuration with api keys redacted.
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config().redacted();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": serde_json::to_value(&config)?
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::test_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_config_hides_api_keys() {
        let fixture = test_state();
        let mut config = fixture.state.get_config().clone();
        config.generation.api_key = "sk-live-secret".to_string();
        let state = AppState::new(
            config,
            fixture.state.pipeline.clone(),
            fixture.state.outbound.clone(),
            fixture.state.synthesizer.clone(),
        );
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/config", web::get().to(get_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["config"]["server"]["port"], 8080);
        assert_eq!(body["config"]["generation"]["api_key"], "********");
        assert_eq!(body["config"]["transcription"]["api_key"], "");
    }
}
