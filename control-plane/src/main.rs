use anyhow::Context;
use clap::Parser;
use control_plane::config::ManagerConfig;
use control_plane::services::{self, HttpPlacement};
use control_plane::{api, AppState, Database};
use infermesh_common::logging;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;

/// infermesh manager: model registry, worker directory and session dispatch
#[derive(Parser, Debug)]
#[command(name = "control-plane")]
#[command(about = "infermesh manager for model dispatch")]
#[command(version)]
struct Cli {
    /// Configuration file (default: ~/.infermesh/manager.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on, overriding the configuration
    #[arg(short, long)]
    port: Option<u16>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => ManagerConfig::default_path()?,
    };
    let mut config = ManagerConfig::load_or_default(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    if config.logging.log_to_file {
        logging::init_production_logging(
            &config.logging.level,
            config.logging.log_dir.clone(),
            "manager.log",
        )?;
    } else {
        logging::init_simple_logging(&config.logging.level)?;
    }

    info!("Starting infermesh manager");

    // Initialize database
    let db_path = match &config.storage.database_path {
        Some(path) => PathBuf::from(path),
        None => Database::default_path()?,
    };
    info!(path = %db_path.display(), "Using database");

    let db_path_str = db_path
        .to_str()
        .with_context(|| format!("Invalid database path (contains invalid UTF-8): {}", db_path.display()))?;
    let db = Database::new(db_path_str)?;

    info!("Running database migrations");
    db.migrate()?;

    let placement = Arc::new(HttpPlacement::new(config.dispatch.cold_start_timeout())?);
    let sweep_interval = config.workers.sweep_interval();
    let addr = format!("{}:{}", config.server.bind_addr, config.server.port);

    let state = AppState::new(config, db, placement)
        .map_err(|e| anyhow::anyhow!("Failed to build manager state: {}", e))?;

    info!("Starting presence monitor");
    tokio::spawn(services::presence_monitor(
        state.directory.clone(),
        state.authority.clone(),
        sweep_interval,
    ));

    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(address = %addr, "Manager listening");

    // Start server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Manager shut down");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
