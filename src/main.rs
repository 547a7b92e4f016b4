//! # STT Relay - Main Application Entry Point
//!
//! Live speech-to-text relay: clients stream PCM audio over a WebSocket, the
//! relay forwards it to Deepgram or Speechmatics over a second WebSocket and
//! streams the transcription back.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: Every connection is handled by lightweight async tasks
//! - **modules**: Code is organized into separate modules (mod statements)
//! - **Result<T, E>**: Startup failures are returned, not panicked on
//! - **Actors**: Each client WebSocket is an actix actor bridged to a tokio task
//!
//! ## Application Architecture:
//! - **config**: Layered configuration (defaults, config.toml, environment)
//! - **events**: Provider-agnostic event model and client message shapes
//! - **provider**: Deepgram and Speechmatics adapters plus the shared drain protocol
//! - **session**: STT coordinator and diagnostic sessions
//! - **websocket**: HTTP → WebSocket upgrade and the actor/session bridge
//! - **state** / **health**: Relay counters and the health endpoint
//! - **error**: Provider, session and HTTP error types

mod config;
mod error;
mod events;
mod health;
mod provider;
mod session;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use crate::config::AppConfig;
use crate::state::AppState;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Creates shared application state** (config + relay counters)
/// 4. **Configures the HTTP server** with the WebSocket and health routes
/// 5. **Handles graceful shutdown** on SIGINT / SIGTERM
#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing();

    // Upstream TLS (wss://) needs a process-wide crypto provider. An Err only
    // means one is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = AppConfig::load().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        default_provider = %config.relay.default_provider,
        deepgram_key = config.deepgram.api_key.is_some(),
        speechmatics_key = config.speechmatics.api_key.is_some(),
        "Configuration loaded: {}:{}",
        config.server.host,
        config.server.port
    );
    if config.deepgram.api_key.is_none() && config.speechmatics.api_key.is_none() {
        warn!("No provider API key configured; STT sessions will fail to start");
    }

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let app_state = web::Data::new(AppState::new(config));

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(TracingLogger::default())
            .route("/ws/echo/", web::get().to(websocket::echo_socket))
            .route("/ws/audio/", web::get().to(websocket::audio_socket))
            .route("/ws/stt/", web::get().to(websocket::stt_socket))
            .route("/ws/stt/{provider}/", web::get().to(websocket::stt_provider_socket))
            .service(web::scope("/api/v1").route("/health", web::get().to(health::health_check)))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)
    .with_context(|| format!("failed to bind {}", bind_addr))?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g. "debug", "stt_relay=trace")
/// - If not set, defaults to "stt_relay=debug,actix_web=info"
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stt_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
