//! weir - shared-buffer live-stream relay.
//!
//! Aggregates multiple upstream sources per channel behind one HTTP
//! endpoint: one upstream connection, many clients, transparent failover.

mod catalog;
mod logging;
mod routes;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use weir_engine::{
    ConcurrencyManager, LoadBalancer, RelayConfig, StreamHandler, StreamRegistry, create_client,
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Server bind configuration.
#[derive(Debug, Clone)]
struct ServerConfig {
    bind_address: String,
    port: u16,
    sources_file: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            sources_file: PathBuf::from("sources.json"),
        }
    }
}

impl ServerConfig {
    /// Load server config from environment variables, falling back to
    /// defaults.
    ///
    /// Supported env vars:
    /// - `BIND_ADDRESS` (e.g. "0.0.0.0")
    /// - `PORT` (e.g. "8080")
    /// - `SOURCES_FILE` (path to the JSON source catalog)
    fn from_env_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(bind_address) = std::env::var("BIND_ADDRESS")
            && !bind_address.trim().is_empty()
        {
            config.bind_address = bind_address;
        }

        if let Ok(port) = std::env::var("PORT")
            && let Ok(parsed) = port.parse::<u16>()
        {
            config.port = parsed;
        }

        if let Ok(sources_file) = std::env::var("SOURCES_FILE")
            && !sources_file.trim().is_empty()
        {
            config.sources_file = PathBuf::from(sources_file);
        }

        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_dir = std::env::var("LOG_DIR").ok();
    let _guard = logging::init_logging(log_dir.as_deref())?;

    info!("Starting weir v{}", env!("CARGO_PKG_VERSION"));

    dotenvy::dotenv().ok();

    let server_config = ServerConfig::from_env_or_default();
    let relay_config = RelayConfig::from_env_or_default();

    let catalog = Arc::new(catalog::load_catalog(&server_config.sources_file)?);
    let concurrency = Arc::new(ConcurrencyManager::new());
    let balancer = Arc::new(LoadBalancer::new(
        &relay_config,
        catalog,
        Arc::clone(&concurrency),
    )?);

    let registry = Arc::new(StreamRegistry::new(relay_config.shared_buffer_size));
    let shutdown = CancellationToken::new();
    registry.start_sweeper(relay_config.registry_sweep_interval, shutdown.clone());

    let client = create_client(&relay_config)?;
    let handler = Arc::new(StreamHandler::new(
        relay_config,
        Arc::clone(&registry),
        balancer,
        client,
    ));

    let state = routes::AppState {
        handler,
        start_time: Instant::now(),
    };

    let addr = format!("{}:{}", server_config.bind_address, server_config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr, "Listening");

    let shutdown_for_serve = shutdown.clone();
    axum::serve(listener, routes::router(state))
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down");
                }
                _ = wait_for_sigterm() => {
                    info!("Received SIGTERM, shutting down");
                }
            }
            shutdown_for_serve.cancel();
        })
        .await?;

    shutdown.cancel();
    info!("weir shutdown complete");
    Ok(())
}

/// Wait for SIGTERM (Unix only).
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    sigterm.recv().await;
}

/// Wait for SIGTERM (non-Unix: pend forever, ctrl_c covers shutdown).
#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
