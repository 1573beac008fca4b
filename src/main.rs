mod cache;
mod config;
mod diagnostics;
mod health;
mod http;
mod metrics;
mod node;
mod upstream;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cache::FileCacheService;
use crate::config::Config;
use crate::diagnostics::ErrorReporter;
use crate::metrics::MetricsRegistry;
use crate::upstream::UpstreamStore;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "blobcache", about = "Tiered file-content cache daemon")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/blobcache/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: Arc<FileCacheService>,
    pub upstream: UpstreamStore,
    pub metrics: MetricsRegistry,
    pub http_client: reqwest::Client,
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let app = http::handler::create_router(Arc::new(state.clone()));

    let listen_addr: std::net::SocketAddr = state
        .config
        .proxy
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting blobcache");

    // ---- Metrics and diagnostics ----
    let metrics = MetricsRegistry::new();
    let reporter = ErrorReporter::new(metrics.metrics.alarms.clone());

    // ---- Cache manager ----
    let cache = Arc::new(FileCacheService::new(
        &config.cache,
        reporter,
        metrics.clone(),
    ));
    cache.init().await?;
    tracing::info!(
        path = %config.cache.path,
        precache_capacity = config.cache.precache_capacity,
        disk_capacity = config.cache.disk_capacity,
        "cache tiers initialised"
    );

    // ---- Upstream store client ----
    let http_client = reqwest::Client::builder()
        .user_agent("blobcache/0.1")
        .connect_timeout(Duration::from_secs(config.upstream.connect_timeout_secs))
        .build()
        .context("failed to build reqwest client")?;
    let upstream = UpstreamStore::new(&config.upstream, http_client.clone());

    // ---- App state ----
    let state = AppState {
        config: Arc::clone(&config),
        cache,
        upstream,
        metrics,
        http_client,
    };

    // ---- Serve until shutdown ----
    run_http_server(state).await?;

    tracing::info!("blobcache shut down cleanly");
    Ok(())
}
