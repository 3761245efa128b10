//! infermesh worker
//!
//! Hosts model versions and executes inference for clients holding a
//! credential minted by the manager.
//!
//! ## Commands
//! - `init` - Write a worker configuration with a fresh identity
//! - `start` - Run the worker daemon
//! - `status` - Show the local configuration and detected capabilities

use agent::{
    api, detect_capabilities, ControlPlaneClient, ReferenceExecutor, RemoteSessionValidator,
    RuntimeConfig, WorkerConfig, WorkerRuntime,
};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use infermesh_common::{logging, AcceleratorClass};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;

/// Period of dedup purge and idle-unload passes.
const MAINTENANCE_PERIOD: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "infermesh-worker")]
#[command(about = "infermesh inference worker", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: ~/.infermesh/worker.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a worker configuration with a fresh worker id
    Init {
        /// Manager URL
        #[arg(short = 'm', long = "control-plane", default_value = "http://localhost:8080")]
        control_plane_url: String,

        /// Address clients use to reach this worker
        #[arg(short, long, default_value = "http://127.0.0.1:9000")]
        advertise: String,

        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        listen: String,

        /// Concurrent session capacity (0 = one per CPU core)
        #[arg(long, default_value = "0")]
        capacity: u32,

        /// Force the accelerator class (cpu or gpu) instead of detecting it
        #[arg(long)]
        accelerator: Option<String>,

        /// API key presented to the manager
        #[arg(long)]
        api_key: Option<String>,

        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Run the worker daemon
    Start {
        /// Override log level (trace, debug, info, warn, error)
        #[arg(short, long)]
        log_level: Option<String>,
    },

    /// Show configuration and detected capabilities
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => WorkerConfig::default_path()?,
    };

    match cli.command {
        Commands::Init {
            control_plane_url,
            advertise,
            listen,
            capacity,
            accelerator,
            api_key,
            force,
        } => {
            let mut config = WorkerConfig::generate(control_plane_url, advertise);
            config.listen_addr = listen;
            config.capacity = capacity;
            config.accelerator = accelerator.as_deref().map(parse_accelerator).transpose()?;
            config.api_key = api_key;
            cmd_init(config, config_path, force)
        }
        Commands::Start { log_level } => cmd_start(config_path, log_level).await,
        Commands::Status => cmd_status(config_path),
    }
}

fn parse_accelerator(value: &str) -> Result<AcceleratorClass> {
    match value.to_ascii_lowercase().as_str() {
        "cpu" => Ok(AcceleratorClass::Cpu),
        "gpu" => Ok(AcceleratorClass::Gpu),
        other => bail!("Unknown accelerator '{}', expected cpu or gpu", other),
    }
}

fn cmd_init(config: WorkerConfig, path: PathBuf, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    config.validate()?;
    config.save(&path)?;

    let capabilities = detect_capabilities(config.capacity, config.accelerator);
    println!("Worker initialized");
    println!("  Worker ID:     {}", config.worker_id);
    println!("  Manager:       {}", config.control_plane_url);
    println!("  Advertise:     {}", config.advertise_address);
    println!("  Accelerator:   {}", capabilities.accelerator);
    println!("  Capacity:      {}", capabilities.max_concurrent_sessions);
    println!("  Configuration: {}", path.display());
    Ok(())
}

async fn cmd_start(path: PathBuf, log_level: Option<String>) -> Result<()> {
    let mut config = WorkerConfig::load(&path)
        .with_context(|| format!("Failed to load {}. Run 'infermesh-worker init' first.", path.display()))?;
    if let Some(level) = log_level {
        config.logging.level = level;
    }
    config.validate()?;

    if config.logging.log_to_file {
        logging::init_production_logging(
            &config.logging.level,
            config.logging.log_dir.clone(),
            "worker.log",
        )?;
    } else {
        logging::init_simple_logging(&config.logging.level)?;
    }

    let capabilities = detect_capabilities(config.capacity, config.accelerator);
    info!(
        worker_id = %config.worker_id,
        accelerator = %capabilities.accelerator,
        capacity = capabilities.max_concurrent_sessions,
        manager = %config.control_plane_url,
        "Starting infermesh worker"
    );

    let client = ControlPlaneClient::new(
        config.control_plane_url.clone(),
        config.api_key.clone(),
        config.manager_timeout(),
    )?;
    let validator = Arc::new(RemoteSessionValidator::new(client.clone()));
    let runtime = Arc::new(WorkerRuntime::new(
        RuntimeConfig::from_config(&config, capabilities),
        Arc::new(ReferenceExecutor::new()),
        validator,
    ));

    tokio::spawn(client.heartbeat_loop(
        runtime.clone(),
        config.advertise_address.clone(),
        config.heartbeat_interval(),
    ));
    tokio::spawn(runtime.clone().maintenance_loop(MAINTENANCE_PERIOD));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!(address = %config.listen_addr, "Worker listening");

    axum::serve(listener, api::create_router(runtime))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Worker shut down");
    Ok(())
}

fn cmd_status(path: PathBuf) -> Result<()> {
    match WorkerConfig::load(&path) {
        Ok(config) => {
            let capabilities = detect_capabilities(config.capacity, config.accelerator);
            println!("Worker configured ({})", path.display());
            println!("  Worker ID:     {}", config.worker_id);
            println!("  Listen:        {}", config.listen_addr);
            println!("  Advertise:     {}", config.advertise_address);
            println!("  Manager:       {}", config.control_plane_url);
            println!("  API key:       {}", if config.api_key.is_some() { "set" } else { "none" });
            println!("\n  Capabilities:");
            println!("    Accelerator: {}", capabilities.accelerator);
            println!("    Capacity:    {}", capabilities.max_concurrent_sessions);
            println!("    CPU cores:   {}", capabilities.cpu_cores);
            println!("    RAM:         {} MB", capabilities.ram_mb);
            println!("    Platform:    {}/{}", capabilities.os, capabilities.arch);
        }
        Err(e) => {
            println!("Worker not initialized: {}", e);
            println!("\nRun 'infermesh-worker init' to create {}", path.display());
        }
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
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
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received terminate signal"),
    }
}
