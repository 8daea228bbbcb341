//! Vigil service binary.
//!
//! Loads the engine configuration, starts the AIOps engine, and serves
//! the HTTP surface (health probe plus the Alertmanager webhook) until a
//! termination signal arrives.

use anyhow::{Context, Result};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vigil_engine::{Engine, EngineConfig};
use vigil_notify::ChannelRouter;

/// Proactive Kubernetes SRE agent with risk-gated auto-remediation
#[derive(Parser)]
#[command(name = "vigil")]
#[command(about = "Proactive Kubernetes SRE agent with risk-gated auto-remediation")]
#[command(version)]
struct Cli {
    /// Path to the engine configuration document
    #[arg(long, default_value = "vigil.json")]
    config: PathBuf,

    /// Log filter when RUST_LOG is not set (e.g. "info", "vigil_engine=debug")
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    let config = if cli.config.exists() {
        EngineConfig::from_file(&cli.config)
            .with_context(|| format!("loading config from {}", cli.config.display()))?
    } else {
        warn!(path = %cli.config.display(), "Config file not found; using defaults");
        EngineConfig::default()
    };

    let sender = Arc::new(ChannelRouter::from_env());
    let addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port)
        .parse()
        .with_context(|| "parsing api.host/api.port")?;

    let engine = Engine::start(config, sender)
        .await
        .context("starting engine")?;

    let app = Router::new()
        .route("/health", get(health))
        .merge(engine.webhook_router())
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("HTTP server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    engine.shutdown().await;
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "vigil",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
