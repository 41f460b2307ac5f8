//! API Service
//!
//! Entry point. Connects the database session, starts the heartbeat
//! watchdog and serves the HTTP surface until SIGINT/SIGTERM.

use api_service::config::Config;
use api_service::handlers::HealthState;
use api_service::observability::MetricsRegistry;
use api_service::routes::{self, AppState};
use api_service::services::{DatabaseSession, PeerProbeClient, PeerServices, PgSession};
use api_service::tasks::{ExitProcess, HeartbeatWatchdog};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "api_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting API service");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        service_name = %config.service_name,
        bind_address = %config.bind_address,
        auth_service_url = %config.auth_service_url,
        image_service_url = %config.image_service_url,
        "Configuration loaded successfully"
    );

    let metrics = Arc::new(MetricsRegistry::new().map_err(|e| {
        error!("Failed to initialize metrics registry: {}", e);
        e
    })?);

    // Connect the database session before accepting traffic
    info!("Connecting to database...");
    let pg_session = Arc::new(PgSession::connect(&config.database).await.map_err(|e| {
        error!("Failed to connect to database: {}", e);
        e
    })?);
    let session: Arc<dyn DatabaseSession> = pg_session.clone();

    // Start the heartbeat watchdog
    let heartbeat_token = CancellationToken::new();
    let heartbeat = HeartbeatWatchdog::new(Arc::clone(&session), Arc::new(ExitProcess))
        .with_interval(config.heartbeat_interval())
        .with_timeout(config.heartbeat_timeout())
        .spawn(heartbeat_token.clone());

    let peer_client = PeerProbeClient::new(config.peer_timeout())?;
    let peers = PeerServices::from_config(&config);
    let health = Arc::new(HealthState::new());
    let bind_address = config.bind_address.clone();
    let drain_seconds = config.shutdown_drain_seconds;

    let state = Arc::new(AppState {
        config,
        session,
        peer_client,
        peers,
        metrics,
        health: Arc::clone(&health),
    });

    let app = routes::build_routes(state);

    let addr: SocketAddr = bind_address.parse().map_err(|e| {
        error!("Invalid bind address: {}", e);
        e
    })?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    health.set_ready();
    info!("API service listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&health), drain_seconds))
        .await?;

    heartbeat_token.cancel();
    if let Err(e) = heartbeat.await {
        warn!("Heartbeat task ended abnormally: {}", e);
    }
    pg_session.close().await;

    info!("API service shutdown complete");

    Ok(())
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
/// Returns when a shutdown signal is received and drain period is complete.
async fn shutdown_signal(health: Arc<HealthState>, drain_seconds: u64) {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => error!("Failed to listen for SIGINT: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    health.set_not_ready();

    if drain_seconds > 0 {
        warn!("Draining connections for {} seconds...", drain_seconds);
        tokio::time::sleep(Duration::from_secs(drain_seconds)).await;
        info!("Drain period complete");
    } else {
        info!("Skipping drain period (SHUTDOWN_DRAIN_SECONDS=0)");
    }
}
