//! Cadence engine - main entry point
//!
//! Runs the schedule loop, the status poller and the backfill orchestrator
//! behind a small JSON control API.

use clap::Parser;
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use cadence_engine::config::{AppConfig, ConfigValidator, DEFAULT_CONFIG_FILE, LoggingConfig};
use cadence_engine::server::Engine;

// Use mimalloc for better performance
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "cadence-engine")]
#[command(about = "Scheduled and historical query execution engine")]
#[command(version)]
struct Args {
    /// Host to bind to (overrides server.host).
    #[arg(long, env = "CADENCE_HOST")]
    host: Option<String>,

    /// Port to listen on (overrides server.port).
    #[arg(short, long, env = "CADENCE_PORT")]
    port: Option<u16>,

    /// Log level or filter directive (overrides logging.level).
    #[arg(long)]
    log_level: Option<String>,

    /// Config file path, extension optional.
    #[arg(short, long, env = "CADENCE_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: String,

    /// Use the scripted executor instead of the platform.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load_unchecked_from(&args.config)?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if args.dry_run {
        config.executor.dry_run = true;
        config.executor.base_url = None;
    }

    init_tracing(&config.logging);

    ConfigValidator::validate(&config)
        .map_err(|e| anyhow::anyhow!("Configuration validation failed:\n\n{e}"))?;
    tracing::info!(config = %args.config, "Configuration loaded");

    let shutdown = CancellationToken::new();
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let engine = Engine::build(config, shutdown.clone()).await?;
    let app = engine.router();
    let tasks = engine.start().await?;

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Background task ended abnormally");
        }
    }

    tracing::info!("Server shut down gracefully");
    Ok(())
}

/// Initialize tracing/logging. `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }
}
