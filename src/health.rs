use crate::metrics::MetricsSnapshot;
use crate::state::AppState;
use crate::synthesis::Readiness;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let metrics = state.get_metrics_snapshot();
    let readiness = state.synthesizer.readiness();
    let active_calls = state.active_calls();

    // Calls can be accepted while the voice warms up; replies just wait for it.
    let status = match readiness {
        Readiness::Ready => "healthy",
        Readiness::WarmingUp | Readiness::Cold => "degraded",
    };

    HttpResponse::Ok().json(json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "telehealth-voice-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "calls": {
            "active": active_calls,
            "capacity": config.performance.max_concurrent_sessions,
            "started": metrics.calls_started,
            "closed": metrics.calls_closed,
            "rejected": metrics.calls_rejected
        },
        "memory": get_memory_info(),
        "services": {
            "transcription": {
                "model": config.transcription.model,
                "endpoint": config.transcription.endpoint,
                "error_rate": metrics.transcription_error_rate()
            },
            "generation": {
                "primary_model": config.generation.primary_model,
                "fallback_model": config.generation.fallback_model
            },
            "synthesis": {
                "voice": config.synthesis.voice,
                "readiness": readiness
            }
        },
        "system": get_system_status(active_calls, config.performance.max_concurrent_sessions)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "counters": metrics,
        "rates": rates(&metrics, uptime_seconds),
        "active_calls": state.active_calls(),
        "connected_media_streams": state.outbound.len(),
        "pending_scheduled_calls": state.pipeline.directory().pending(),
        "memory": get_memory_info(),
        "performance": {
            "max_concurrent_sessions": state.get_config().performance.max_concurrent_sessions,
            "max_parallel_synthesis": state.get_config().synthesis.max_parallel
        }
    }))
}

fn rates(metrics: &MetricsSnapshot, uptime_seconds: u64) -> serde_json::Value {
    let ratio = |part: u64, whole: u64| {
        if whole > 0 {
            part as f64 / whole as f64
        } else {
            0.0
        }
    };

    json!({
        "transcription_error_rate": metrics.transcription_error_rate(),
        "fallback_reply_rate": ratio(metrics.fallback_replies, metrics.replies),
        "frame_drop_rate": ratio(metrics.frames_dropped, metrics.frames_received),
        "calls_per_hour": if uptime_seconds > 0 {
            metrics.calls_started as f64 * 3600.0 / uptime_seconds as f64
        } else {
            0.0
        }
    })
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = std::process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let field = |name: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024
            };

            return json!({
                "resident_memory_bytes": field("VmRSS:"),
                "virtual_memory_bytes": field("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

fn get_system_status(active_calls: usize, max_calls: usize) -> serde_json::Value {
    let usage = if max_calls > 0 {
        active_calls as f64 / max_calls as f64
    } else {
        0.0
    };

    let status = if usage >= 1.0 {
        "at_capacity"
    } else if usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "call_usage_percent": (usage * 100.0).round(),
        "max_calls": max_calls,
        "current_calls": active_calls,
        "load_warnings": if usage > 0.8 {
            vec!["High call volume - new calls are rejected at max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::test_state;
    use actix_web::test::{call_and_read_body_json, init_service, TestRequest};
    use actix_web::App;

    #[actix_web::test]
    async fn test_health_reports_calls_and_synthesizer() {
        let fixture = test_state();
        let app = init_service(
            App::new()
                .app_data(web::Data::new(fixture.state.clone()))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "degraded");
        assert_eq!(body["services"]["synthesis"]["readiness"], "cold");
        assert_eq!(body["calls"]["active"], 0);
        assert_eq!(body["calls"]["capacity"], fixture.state.get_config().performance.max_concurrent_sessions);
    }

    #[actix_web::test]
    async fn test_metrics_exposes_counters() {
        let fixture = test_state();
        fixture.state.pipeline.metrics().record(|m| {
            m.windows_transcribed = 3;
            m.transcription_failures = 1;
        });
        let app = init_service(
            App::new()
                .app_data(web::Data::new(fixture.state.clone()))
                .route("/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let req = TestRequest::get().uri("/metrics").to_request();
        let body: serde_json::Value = call_and_read_body_json(&app, req).await;

        assert_eq!(body["counters"]["windows_transcribed"], 3);
        assert_eq!(body["rates"]["transcription_error_rate"], 0.25);
        assert_eq!(body["connected_media_streams"], 0);
    }

    #[test]
    fn test_system_status_at_capacity() {
        let status = get_system_status(4, 4);
        assert_eq!(status["status"], "at_capacity");
        assert_eq!(status["call_usage_percent"], 100.0);
    }
}
