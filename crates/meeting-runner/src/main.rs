//! Meeting Runner
//!
//! Live coordinator for scribe-driven meetings.
//!
//! # Servers
//!
//! - HTTP server for `/health`, `/ready` and `/metrics`
//!   (default: 0.0.0.0:8091)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing and the Prometheus metrics recorder
//! 3. Connect the meeting store (Redis, or in-memory for local dev)
//! 4. Initialize the actor system (`RunnerControllerHandle`)
//! 5. Start the health HTTP server
//! 6. Wait for shutdown signal, then drain

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use meeting_runner::actors::{ActorMetrics, RunnerContext, RunnerControllerHandle, RunnerSettings};
use meeting_runner::clock::SystemClock;
use meeting_runner::config::{Config, StoreBackend};
use meeting_runner::observability::{health_router, init_metrics_recorder, HealthState};
use meeting_runner::store::memory::InMemoryStore;
use meeting_runner::store::redis::RedisMeetingStore;
use meeting_runner::store::MeetingStore;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long meeting runners get to drain on shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Configuration first: it decides the log format.
    let config = Config::from_env()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "meeting_runner=debug,tower_http=debug".into());
    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting Meeting Runner");
    info!(
        runner_id = %config.runner_id,
        store = ?config.store,
        health_bind_address = %config.health_bind_address,
        max_meetings = config.max_meetings,
        event_buffer = config.event_buffer,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded.
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    let store: Arc<dyn MeetingStore> = match &config.store {
        StoreBackend::Redis { url } => {
            info!("Connecting to Redis...");
            let store = RedisMeetingStore::connect(url).await.map_err(|e| {
                error!(error = %e, "Failed to connect to Redis");
                e
            })?;
            store.ping().await.map_err(|e| {
                error!(error = %e, "Redis did not answer PING");
                e
            })?;
            info!("Redis connection established");
            Arc::new(store)
        }
        StoreBackend::Memory => {
            warn!("Using in-memory store; meeting state will not survive a restart");
            Arc::new(InMemoryStore::new())
        }
    };
    health_state.set_store_ready();

    info!("Initializing actor system...");
    let context = RunnerContext {
        store,
        clock: Arc::new(SystemClock),
        settings: RunnerSettings::from(&config),
        metrics: ActorMetrics::new(),
    };
    let controller_handle = RunnerControllerHandle::new(
        config.runner_id.clone(),
        context,
        config.max_meetings,
        Arc::clone(&health_state),
    );
    info!("Actor system initialized");

    let shutdown_token = controller_handle.child_token();

    // Fail startup if the health server cannot bind.
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let app = health_router(Arc::clone(&health_state), Some(prometheus_handle))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    info!("Meeting Runner running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Stop readiness first so no new meetings are routed here.
    health_state.set_draining();

    if let Err(e) = controller_handle.shutdown(SHUTDOWN_DEADLINE).await {
        warn!(error = %e, "Actor system shutdown error");
    }

    // The controller stops reading its mailbox while it drains, so this
    // request only resolves (with an error) once the actor has exited.
    if tokio::time::timeout(SHUTDOWN_DEADLINE, controller_handle.get_status())
        .await
        .is_err()
    {
        warn!("Meeting runners did not drain before the deadline");
    }

    info!("Meeting Runner shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. Without them the service
/// cannot shut down gracefully.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
