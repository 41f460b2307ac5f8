//! Test server harness for E2E testing
//!
//! Provides `TestApiServer` for spawning real API service instances in tests.

use api_service::config::Config;
use api_service::handlers::HealthState;
use api_service::observability::MetricsRegistry;
use api_service::routes::{self, AppState};
use api_service::services::{DatabaseSession, PeerProbeClient, PeerServices};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Peer timeout used by test servers, in seconds.
pub const TEST_PEER_TIMEOUT_SECONDS: &str = "2";

/// Test harness for spawning the API service in E2E tests.
///
/// The server uses the real router with an injected database session and
/// peer base URLs (typically `wiremock` servers). No heartbeat is started.
pub struct TestApiServer {
    addr: SocketAddr,
    config: Config,
    metrics: Arc<MetricsRegistry>,
    health: Arc<HealthState>,
    _handle: JoinHandle<()>,
}

impl TestApiServer {
    /// Spawn a new test server instance.
    ///
    /// The server will:
    /// - Bind to a random available port (127.0.0.1:0)
    /// - Report ready on `/ready`
    /// - Start the HTTP server in the background
    pub async fn spawn(
        session: Arc<dyn DatabaseSession>,
        auth_url: &str,
        image_url: &str,
    ) -> Result<Self, anyhow::Error> {
        let vars = HashMap::from([
            ("DB_HOST".to_string(), "localhost".to_string()),
            ("DB_USER".to_string(), "test".to_string()),
            ("DB_PASSWORD".to_string(), "test-password".to_string()),
            ("DB_NAME".to_string(), "test".to_string()),
            ("BIND_ADDRESS".to_string(), "127.0.0.1:0".to_string()),
            ("AUTH_SERVICE_URL".to_string(), auth_url.to_string()),
            ("IMAGE_SERVICE_URL".to_string(), image_url.to_string()),
            (
                "PEER_TIMEOUT_SECONDS".to_string(),
                TEST_PEER_TIMEOUT_SECONDS.to_string(),
            ),
        ]);

        let config = Config::from_vars(&vars)
            .map_err(|e| anyhow::anyhow!("Failed to create config: {}", e))?;

        let metrics = Arc::new(
            MetricsRegistry::new()
                .map_err(|e| anyhow::anyhow!("Failed to create metrics registry: {}", e))?,
        );
        let peer_client = PeerProbeClient::new(config.peer_timeout())
            .map_err(|e| anyhow::anyhow!("Failed to create peer client: {}", e))?;
        let health = Arc::new(HealthState::new());

        let state = Arc::new(AppState {
            config: config.clone(),
            session,
            peer_client,
            peers: PeerServices::from_config(&config),
            metrics: Arc::clone(&metrics),
            health: Arc::clone(&health),
        });

        let app = routes::build_routes(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        health.set_ready();

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            config,
            metrics,
            health,
            _handle: handle,
        })
    }

    /// Get the base URL of the test server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get reference to the server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the metrics registry the server records into.
    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Get the server's health flags.
    pub fn health(&self) -> &HealthState {
        &self.health
    }
}

impl Drop for TestApiServer {
    fn drop(&mut self) {
        // Abort the HTTP server task so the port is released when the test ends
        self._handle.abort();
    }
}
