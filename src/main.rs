//! # Rehearsal Relay - Main Application Entry Point
//!
//! This is the entry point for the rehearsal-relay server: a real-time audio
//! transcription relay that pairs each connecting client with a streaming
//! connection to a cloud speech-to-text provider and shuttles audio one way
//! and transcripts the other for the life of the rehearsal session.
//!
//! ## Application Architecture:
//! - **config**: Environment-driven configuration (listener, provider parameters, relay policy)
//! - **state**: Shared application state and aggregate session metrics
//! - **supervisor**: Session registry and the graceful-shutdown cascade
//! - **relay**: The per-session forwarding core and its failure-coupling policy
//! - **upstream**: Provider bindings and the streaming connection lifecycle
//! - **websocket**: The browser-facing connection actor
//! - **health**: Plain-text liveness routes
//! - **error**: The relay error taxonomy
//!
//! ## Process Lifecycle:
//! Startup builds the configuration once and passes it down by reference;
//! there is no process-wide mutable state beyond the shutdown flag. On
//! SIGTERM/SIGINT the supervisor cancels every live session, waits out the
//! grace period, and the process exits non-zero if any session had to be
//! force-closed.

mod config;
mod error;
mod health;
mod relay;
mod state;
mod supervisor;
mod upstream;
mod websocket;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::AppConfig;
use crate::state::AppState;

/// Global shutdown signal, set by the signal handler task and polled by the
/// main task. The one piece of process-wide mutable state.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting rehearsal-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{}, provider {}",
        config.server.host, config.server.port, config.upstream.provider
    );

    let provider = upstream::create_provider(&config.upstream.provider)?;
    let app_state = AppState::new(config.clone(), provider);
    let state = app_state.clone();
    let registry = app_state.registry();
    let shutdown_grace = Duration::from_millis(config.relay.shutdown_grace_ms);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        // The web client is served from a different origin.
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            // "/" doubles as the WebSocket endpoint and the liveness route.
            .route("/", web::get().to(websocket::relay_entry))
            .route("/health", web::get().to(health::health_check))
            .default_service(web::route().to(health::not_found))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    let mut forced_sessions = 0;

    // Wait for either the server to finish (usually an error) OR a shutdown
    // signal, whichever comes first.
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
            info!("Shutdown signal received, draining sessions...");
            forced_sessions = registry.shutdown(shutdown_grace).await;
            server_handle.stop(true).await;
        }
    }

    let metrics = state.metrics_snapshot();
    info!(
        uptime_seconds = state.uptime_seconds(),
        sessions_started = metrics.sessions_started,
        sessions_ended = metrics.sessions_ended,
        sessions_errored = metrics.sessions_errored,
        "Server stopped"
    );

    if forced_sessions > 0 {
        error!(
            forced_sessions,
            "forced shutdown was required for one or more sessions"
        );
        std::process::exit(1);
    }

    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "rehearsal_relay=debug")
/// - If not set, defaults to "rehearsal_relay=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rehearsal_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Set up signal handlers for graceful shutdown.
///
/// ## What this does:
/// - Listens for SIGTERM (termination signal from the platform)
/// - Listens for SIGINT (interrupt signal, usually Ctrl+C)
/// - When either signal is received, sets the global shutdown flag
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

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
/// Polls the flag rather than threading a channel through the server setup;
/// 100ms of shutdown latency is well inside the grace period.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
