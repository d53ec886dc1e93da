//! # Telehealth Voice Backend - Main Application Entry Point
//!
//! This is the main entry point for the telehealth-voice-backend server.
//! It places FIT kit reminder calls: the telephony provider streams call
//! audio over a WebSocket, we transcribe it, reply with a language model and
//! speak the reply back on the same stream.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: Every call runs as a handful of cooperating async tasks
//! - **modules**: Code is organized into separate modules (mod statements)
//! - **Result<T, E>**: Start-up fails fast with `anyhow`; call errors are values
//! - **Arc & trait objects**: Shared, swappable capabilities (models, speech, audit)
//! - **static**: Global shutdown flag that lives for the entire program
//!
//! ## Application Architecture:
//! - **config**: Handles application configuration (TOML files + environment variables)
//! - **state**: Wires the call pipeline and shares it with every request
//! - **call**: Per-call lifecycle (registry, ingest, dialogue, teardown)
//! - **audio / transcription / conversation / synthesis**: The pipeline stages
//! - **websocket**: The media stream the telephony provider connects to
//! - **health / handlers**: HTTP endpoints for monitoring and call control
//! - **audit / persistence**: PHI audit trail and saved call outcomes
//! - **error**: Pipeline error taxonomy and HTTP error responses

mod audio;
mod audit;
mod call;
mod cancel;
mod config;
mod conversation;
mod error;
mod handlers;
mod health;
mod metrics;
mod persistence;
mod state;
mod synthesis;
mod transcription;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown signal, set by the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Refuses to start** without model credentials
/// 3. **Wires the call pipeline** and starts the speech warm-up in the background
/// 4. **Configures the HTTP server** with the WebSocket media stream and the REST routes
/// 5. **Handles graceful shutdown** when receiving system signals
///
/// ## Error Handling:
/// Configuration and credential problems are the only fatal errors. Everything
/// that goes wrong during a call is handled inside the call.
#[actix_web::main]
async fn main() -> Result<()> {
    // .ok() means "ignore errors" - it's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;
    config.require_credentials()?;

    info!("Starting telehealth-voice-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let app_state = AppState::from_config(config).context("failed to wire call pipeline")?;

    // Warm-up runs in the background; replies wait for it (bounded) instead of
    // delaying the server start.
    app_state.synthesizer.start_warmup();

    setup_signal_handlers();

    let registry = app_state.pipeline.registry().clone();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/calls", web::get().to(handlers::list_calls)),
            )
            .route("/call/start", web::post().to(handlers::schedule_call))
            .route("/call/status", web::post().to(handlers::call_status))
            .route("/ws/media", web::get().to(websocket::media_stream))
            // Also provide health check at root level for convenience
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            let in_flight = registry.active_call_ids();
            info!(calls = ?in_flight, "Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "info", "audit=info,telehealth_voice_backend=debug")
/// - If not set, defaults to "telehealth_voice_backend=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "telehealth_voice_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Set up signal handlers for graceful shutdown.
///
/// Listens for SIGTERM and SIGINT; either one sets the global shutdown flag.
/// If a handler cannot be installed the server keeps running without it.
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait for the shutdown signal to be set.
///
/// Polls the flag every 100ms; `tokio::time::sleep` yields to other tasks
/// between checks.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
