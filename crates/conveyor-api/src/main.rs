//! Conveyor API Server

use clap::Parser;
use conveyor_api::services::git::GitRemoteHeads;
use conveyor_api::tasks::BackgroundTasks;
use conveyor_api::{AppState, routes};
use conveyor_config::SystemConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conveyor-server")]
#[command(about = "Conveyor CI/CD trigger engine", long_about = None)]
struct Args {
    /// Path to the KDL system configuration
    #[arg(long, env = "CONVEYOR_CONFIG", default_value = "conveyor.kdl")]
    config: PathBuf,

    /// Address to listen on, overriding the configuration
    #[arg(long, env = "CONVEYOR_LISTEN")]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args.config)?.with_env_overrides();
    info!(
        jobs = config.jobs.len(),
        max_concurrent_jobs = config.scheduler.max_concurrent_jobs,
        dedup_ttl = ?config.webhook.dedup_ttl,
        "Configuration loaded"
    );
    if config.webhook.github_secret.is_none() {
        warn!("No GitHub webhook secret configured, GitHub pushes will be rejected");
    }

    let state = AppState::from_config(&config)?;
    let tasks = BackgroundTasks::spawn(&state, &config, Arc::new(GitRemoteHeads::new()));

    if config.scheduler.autostart {
        state.scheduler.start_processing().await;
    }

    // Build router
    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // Start server
    let addr = args.listen.unwrap_or(config.server.listen);
    info!("Starting server on {}", addr);

    let listener = TcpListener::bind(addr.as_str()).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tasks.shutdown().await;
    info!("Server stopped");
    Ok(())
}

/// A missing file means defaults; anything unreadable or invalid is fatal.
fn load_config(path: &Path) -> anyhow::Result<SystemConfig> {
    if !path.exists() {
        warn!(path = %path.display(), "Configuration file not found, using defaults");
        return Ok(SystemConfig::default());
    }
    Ok(SystemConfig::load(path)?)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
