use std::env;
use std::sync::Arc;

use anyhow::anyhow;
use axum::Router;
use axum::routing::{delete, get, post};
use tokio::net::TcpListener;
use tracing::info;

use voicelink::server::handlers;
use voicelink::{AppState, Config, WhipServer, logging};

const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path)
        .map_err(|e| anyhow!("failed to load config {config_path}: {e}"))?;

    // Initialize tracing; the guard flushes file output on exit
    let _log_guard = logging::init(&config.log);

    // Initialize crypto provider for TLS connections
    // This must be done before any TLS connections are attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    // WebRTC API + the single muxed media socket
    let server = Arc::new(WhipServer::init(config.clone()).await?);
    let state = AppState {
        server: Arc::clone(&server),
        config: config.clone(),
    };

    let app = Router::new()
        .route("/", get(handlers::health_check))
        .route("/whip", post(handlers::handle_whip))
        .route("/whip/sessions/{id}", delete(handlers::handle_delete))
        .with_state(state);

    let address = format!("0.0.0.0:{}", config.server.http_port);
    let listener = TcpListener::bind(&address).await?;
    info!("voicelink server listening on {address}");

    axum::serve(listener, app).await?;

    server.shutdown().await;
    Ok(())
}
